//! Ranking metrics over scored instances.
use std::cmp::Ordering;
use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::batch::Batch;
use crate::Index;

/// A scored instance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Prediction {
    /// Whether the instance is a positive.
    pub label: bool,
    /// Model score.
    pub score: f32,
    /// Group the instance is ranked within, usually the user.
    pub group_id: Index,
}

/// Pair the instances of `batches` with their scores, in input order.
///
/// Extra scores or instances are ignored.
pub fn predictions(batches: &[Batch], scores: &[f32]) -> Vec<Prediction> {
    let labels = batches.iter().flat_map(|batch| batch.labels());
    let group_ids = batches.iter().flat_map(|batch| batch.group_ids());

    izip!(labels, group_ids, scores)
        .map(|(label, group_id, &score)| Prediction {
            label,
            score,
            group_id,
        })
        .collect()
}

/// A metric computed from predictions.
pub trait Metric {
    /// Short metric name.
    fn name(&self) -> &'static str;
    /// Compute the metric. Returns `None` when it is undefined for the
    /// given predictions, for example when there are no positives.
    fn evaluate(&self, predictions: &[Prediction]) -> Option<f32>;
}

/// Area under the ROC curve over all predictions, ties counted as half.
#[derive(Clone, Copy, Debug, Default)]
pub struct Auc;

impl Metric for Auc {
    fn name(&self) -> &'static str {
        "auc"
    }

    fn evaluate(&self, predictions: &[Prediction]) -> Option<f32> {
        let num_positives = predictions.iter().filter(|x| x.label).count() as f64;
        let num_negatives = predictions.len() as f64 - num_positives;

        if num_positives == 0.0 || num_negatives == 0.0 {
            return None;
        }

        let mut sorted: Vec<&Prediction> = predictions.iter().collect();
        sorted.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));

        let mut positive_rank_sum = 0.0;
        let mut start = 0;

        while start < sorted.len() {
            let mut stop = start + 1;
            while stop < sorted.len() && sorted[stop].score == sorted[start].score {
                stop += 1;
            }

            // Mean of the 1-based ranks start + 1 ..= stop.
            let rank = (start + stop + 1) as f64 / 2.0;
            let positives_in_run = sorted[start..stop].iter().filter(|x| x.label).count();
            positive_rank_sum += rank * positives_in_run as f64;

            start = stop;
        }

        let auc = (positive_rank_sum - num_positives * (num_positives + 1.0) / 2.0)
            / (num_positives * num_negatives);

        Some(auc as f32)
    }
}

/// Mean log loss, with scores clipped away from 0 and 1.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogLoss;

impl Metric for LogLoss {
    fn name(&self) -> &'static str {
        "log_loss"
    }

    fn evaluate(&self, predictions: &[Prediction]) -> Option<f32> {
        if predictions.is_empty() {
            return None;
        }

        let epsilon = 1e-7;
        let total: f64 = predictions
            .iter()
            .map(|x| {
                let score = f64::from(x.score).max(epsilon).min(1.0 - epsilon);
                if x.label {
                    -score.ln()
                } else {
                    -(1.0 - score).ln()
                }
            })
            .sum();

        Some((total / predictions.len() as f64) as f32)
    }
}

/// Mean reciprocal rank of the best-ranked positive of each group.
///
/// Groups without positives are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mrr;

impl Metric for Mrr {
    fn name(&self) -> &'static str {
        "mrr"
    }

    fn evaluate(&self, predictions: &[Prediction]) -> Option<f32> {
        let mut groups: BTreeMap<Index, Vec<f32>> = BTreeMap::new();
        let mut positives: BTreeMap<Index, f32> = BTreeMap::new();

        for prediction in predictions {
            groups
                .entry(prediction.group_id)
                .or_insert_with(Vec::new)
                .push(prediction.score);

            if prediction.label {
                let best = positives
                    .entry(prediction.group_id)
                    .or_insert(std::f32::MIN);
                *best = best.max(prediction.score);
            }
        }

        let mrrs: Vec<f32> = groups
            .into_iter()
            .collect::<Vec<_>>()
            .par_iter()
            .filter_map(|(group_id, scores)| {
                let test_score = *positives.get(group_id)?;
                let rank = scores.iter().filter(|&&score| score >= test_score).count();

                Some(1.0 / rank as f32)
            })
            .collect();

        if mrrs.is_empty() {
            None
        } else {
            Some(mrrs.iter().sum::<f32>() / mrrs.len() as f32)
        }
    }
}

/// Compute each metric, paired with its name.
pub fn evaluate(
    metrics: &[&dyn Metric],
    predictions: &[Prediction],
) -> Vec<(&'static str, Option<f32>)> {
    metrics
        .iter()
        .map(|metric| (metric.name(), metric.evaluate(predictions)))
        .collect()
}
