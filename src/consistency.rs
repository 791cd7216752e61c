//! Comparing offline (trainable) and online (frozen) scores.
//!
//! Divergence is reported, not raised: every instance is compared, and
//! the report carries the number of mismatches, the first one, and the
//! largest relative error seen.
use std::path::Path;

use failure;

use crate::artifact;
use crate::batch::{Batch, BatchAssembler};
use crate::data::read_instances;
use crate::models::attention::TrainableScorer;
use crate::models::{Scorer, ScoringContext};
use crate::vocabulary::Vocabularies;
use crate::{DataError, PredictionError};

/// Relative error between two scores.
///
/// The difference is scaled by the larger magnitude of the two; two
/// equal scores, including two zeros, have no error. Any non-finite
/// input yields NaN.
pub fn relative_error(offline: f32, online: f32) -> f32 {
    if !(offline.is_finite() && online.is_finite()) {
        return std::f32::NAN;
    }

    let delta = (offline - online).abs();
    if delta == 0.0 {
        0.0
    } else {
        delta / offline.abs().max(online.abs())
    }
}

/// A single instance whose scores disagree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mismatch {
    /// Position of the instance in input order.
    pub index: usize,
    /// Score of the trainable scorer.
    pub offline: f32,
    /// Score of the frozen scorer.
    pub online: f32,
    /// Absolute difference of the two.
    pub delta: f32,
}

/// Outcome of comparing two score sequences.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Number of instances compared.
    pub compared: usize,
    /// Number of instances outside the tolerance.
    pub mismatches: usize,
    /// The earliest mismatching instance.
    pub first_mismatch: Option<Mismatch>,
    /// Largest relative error over all finite pairs.
    pub max_relative_error: f32,
}

impl ConsistencyReport {
    /// Whether every instance was within tolerance.
    pub fn is_consistent(&self) -> bool {
        self.mismatches == 0
    }
}

/// Compare two score sequences instance by instance.
///
/// A pair is a mismatch when its [`relative_error`] exceeds `tolerance`
/// or is not a number. If the sequences differ in length, every
/// unpaired score is a mismatch too.
pub fn compare(offline: &[f32], online: &[f32], tolerance: f32) -> ConsistencyReport {
    let compared = offline.len().max(online.len());

    let mut report = ConsistencyReport {
        compared,
        mismatches: 0,
        first_mismatch: None,
        max_relative_error: 0.0,
    };

    for index in 0..compared {
        let offline_score = offline.get(index).cloned().unwrap_or(std::f32::NAN);
        let online_score = online.get(index).cloned().unwrap_or(std::f32::NAN);

        let error = relative_error(offline_score, online_score);

        if error.is_finite() {
            report.max_relative_error = report.max_relative_error.max(error);
        }

        if !(error <= tolerance) {
            let mismatch = Mismatch {
                index,
                offline: offline_score,
                online: online_score,
                delta: (offline_score - online_score).abs(),
            };

            tracing::warn!(
                "Score mismatch at instance {}: offline {} online {} delta {}",
                mismatch.index,
                mismatch.offline,
                mismatch.online,
                mismatch.delta
            );

            report.mismatches += 1;
            if report.first_mismatch.is_none() {
                report.first_mismatch = Some(mismatch);
            }
        }
    }

    report
}

/// Score every batch with `scorer` using a fresh context, concatenating
/// the scores in input order.
pub fn score_all<T: Scorer>(scorer: &T, batches: &[Batch]) -> Result<Vec<f32>, PredictionError> {
    let mut context = ScoringContext::new();
    let mut scores = Vec::with_capacity(batches.iter().map(|batch| batch.len()).sum());

    for batch in batches {
        scores.extend(scorer.score(&mut context, batch)?);
        tracing::debug!(
            "Scored batch {} of {} instances",
            context.batches_scored(),
            batch.len()
        );
    }

    Ok(scores)
}

/// Run both scorers over the same batches, each with its own context,
/// and compare their scores.
pub fn check<A: Scorer, B: Scorer>(
    offline: &A,
    online: &B,
    batches: &[Batch],
    tolerance: f32,
) -> Result<ConsistencyReport, PredictionError> {
    let offline_scores = score_all(offline, batches)?;
    let online_scores = score_all(online, batches)?;

    Ok(compare(&offline_scores, &online_scores, tolerance))
}

/// Check the trainable scorer against its own exported artifact over
/// every instance of a log file.
///
/// Fails with [`DataError::EmptyBatch`] before any scoring when the
/// file holds no instances.
pub fn run_file<P: AsRef<Path>>(
    path: P,
    vocabularies: &Vocabularies,
    assembler: &BatchAssembler,
    trainable: &TrainableScorer,
    tolerance: f32,
) -> Result<ConsistencyReport, failure::Error> {
    let instances = read_instances(path.as_ref())?;

    if instances.is_empty() {
        return Err(DataError::EmptyBatch.into());
    }

    let mapped = vocabularies.map_all(&instances);
    let batches = assembler
        .minibatches(&mapped, trainable.hyperparameters().get_batch_size())
        .collect::<Result<Vec<_>, _>>()?;

    let frozen = artifact::load(artifact::export(trainable))?;
    let report = check(trainable, &frozen, &batches, tolerance)?;

    tracing::info!(
        "Compared {} instances from {}: {} mismatches, max relative error {}",
        report.compared,
        path.as_ref().display(),
        report.mismatches,
        report.max_relative_error
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use proptest::prelude::*;

    use crate::data::{Instance, MappedInstance};
    use crate::models::attention::Hyperparameters;
    use crate::models::frozen::FrozenScorer;
    use crate::models::Loss;

    const SCENARIO: &str = "1\tU1\tI9\tC1\t1000\tI1,I2\tC1,C1\t500,700\n\
                            0\tU1\tI3\tC1\t1000\tI1,I2\tC1,C1\t500,700\n\
                            0\tU1\tI4\tC1\t1000\tI1,I2\tC1,C1\t500,700\n\
                            0\tU1\tI5\tC1\t1000\tI1,I2\tC1,C1\t500,700\n\
                            0\tU1\tI6\tC1\t1000\tI1,I2\tC1,C1\t500,700\n";

    fn write_log(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn scenario() -> (Vocabularies, Vec<Instance>) {
        let instances: Vec<Instance> = SCENARIO
            .lines()
            .map(|line| line.parse().unwrap())
            .collect();

        (Vocabularies::build(&instances), instances)
    }

    fn model(vocabularies: &Vocabularies) -> Hyperparameters {
        Hyperparameters::new(vocabularies.items().len(), vocabularies.categories().len())
            .embedding_dim(6)
            .negatives_per_positive(4)
            .learning_rate(0.05)
            .num_epochs(2)
            .from_seed([5; 16])
    }

    #[test]
    fn relative_error_edge_cases() {
        assert_eq!(relative_error(0.0, 0.0), 0.0);
        assert_eq!(relative_error(0.5, 0.5), 0.0);
        assert!((relative_error(0.5, 0.25) - 0.5).abs() < 1e-6);
        assert!(relative_error(0.5, std::f32::NAN).is_nan());
    }

    #[test]
    fn compare_counts_every_mismatch() {
        let offline = [0.1, 0.2, 0.3, 0.4];
        let online = [0.1, 0.25, 0.3, 0.5];

        let report = compare(&offline, &online, 1e-4);

        assert_eq!(report.compared, 4);
        assert_eq!(report.mismatches, 2);
        assert!(!report.is_consistent());

        let first = report.first_mismatch.unwrap();
        assert_eq!(first.index, 1);
        assert!((first.delta - 0.05).abs() < 1e-6);
        assert!((report.max_relative_error - 0.2).abs() < 1e-6);
    }

    #[test]
    fn compare_flags_missing_and_non_finite_scores() {
        let report = compare(&[0.1, std::f32::NAN, 0.3], &[0.1, 0.2], 1e-4);

        assert_eq!(report.compared, 3);
        assert_eq!(report.mismatches, 2);
        assert_eq!(report.first_mismatch.unwrap().index, 1);
        assert_eq!(report.max_relative_error, 0.0);
    }

    #[test]
    fn scenario_end_to_end() {
        let (vocabularies, instances) = scenario();
        let hyper = model(&vocabularies);
        let assembler = hyper.assembler();

        let mapped = vocabularies.map_all(&instances);
        let batch = assembler.assemble(&mapped).unwrap();

        assert_eq!(batch.len(), 5);
        assert!(batch.mask().iter().all(|&x| x));
        assert_eq!(batch.mask().dim(), (5, 2));

        let mut trainable = hyper.build();
        trainable.fit(&[batch.clone()]).unwrap();

        let scores = trainable
            .score(&mut ScoringContext::new(), &batch)
            .unwrap();
        assert_eq!(scores.len(), 5);

        let file = write_log(SCENARIO);
        let report = run_file(file.path(), &vocabularies, &assembler, &trainable, 1e-4).unwrap();

        assert_eq!(report.compared, 5);
        assert!(report.is_consistent(), "{:?}", report);
    }

    #[test]
    fn exported_scorer_agrees_after_training() {
        let (vocabularies, instances) = scenario();

        for &loss in &[Loss::Logistic, Loss::BPR] {
            let hyper = model(&vocabularies).loss(loss);
            let batches = vec![hyper
                .assembler()
                .assemble(&vocabularies.map_all(&instances))
                .unwrap()];

            let mut trainable = hyper.build();
            trainable.fit(&batches).unwrap();

            let frozen = artifact::load(artifact::export(&trainable)).unwrap();
            let report = check(&trainable, &frozen, &batches, 1e-4).unwrap();

            assert_eq!(report.compared, 5);
            assert!(report.is_consistent(), "{:?}", report);
        }
    }

    #[test]
    fn frozen_scorer_is_isolated_from_training() {
        let (vocabularies, instances) = scenario();
        let hyper = model(&vocabularies).learning_rate(0.5);
        let batches = vec![hyper
            .assembler()
            .assemble(&vocabularies.map_all(&instances))
            .unwrap()];

        let mut trainable = hyper.build();
        let frozen = FrozenScorer::load(trainable.export()).unwrap();
        let before = score_all(&frozen, &batches).unwrap();

        trainable.fit(&batches).unwrap();

        assert_eq!(score_all(&frozen, &batches).unwrap(), before);
        assert!(!check(&trainable, &frozen, &batches, 1e-4)
            .unwrap()
            .is_consistent());
    }

    #[test]
    fn unknown_identifiers_are_scored() {
        let (vocabularies, _) = scenario();
        let file = write_log("0\tU7\tI42\tC9\t2000\tI1,I77\tC1,C8\t100,200\n");

        let report = run_file(
            file.path(),
            &vocabularies,
            &BatchAssembler::new(0),
            &model(&vocabularies).build(),
            1e-4,
        )
        .unwrap();

        assert_eq!(report.compared, 1);
        assert!(report.is_consistent());
    }

    #[test]
    fn empty_file_fails_before_scoring() {
        let (vocabularies, _) = scenario();
        let file = write_log("");

        let error = run_file(
            file.path(),
            &vocabularies,
            &BatchAssembler::new(4),
            &model(&vocabularies).build(),
            1e-4,
        )
        .unwrap_err();

        assert_eq!(error.downcast::<DataError>().unwrap(), DataError::EmptyBatch);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let (vocabularies, _) = scenario();
        let file = write_log("1\tU1\tI9\tC1\t1000\tI1,I2\tC1\t500,700\n");

        let error = run_file(
            file.path(),
            &vocabularies,
            &BatchAssembler::new(4),
            &model(&vocabularies).build(),
            1e-4,
        )
        .unwrap_err();

        match error.downcast::<DataError>().unwrap() {
            DataError::MalformedRecord { line, .. } => assert_eq!(line, 1),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    const NUM_ITEMS: usize = 12;
    const NUM_CATEGORIES: usize = 4;

    fn mapped_instance() -> impl Strategy<Value = MappedInstance> {
        let entry = (0..NUM_ITEMS, 0..NUM_CATEGORIES, 0i64..100_000);

        (
            any::<bool>(),
            0..NUM_ITEMS,
            0..NUM_CATEGORIES,
            0i64..200_000,
            proptest::collection::vec(entry, 0..6),
        )
            .prop_map(|(label, item_id, category_id, timestamp, history)| {
                MappedInstance {
                    label,
                    user_id: 0,
                    item_id,
                    category_id,
                    timestamp,
                    history_item_ids: history.iter().map(|x| x.0).collect(),
                    history_category_ids: history.iter().map(|x| x.1).collect(),
                    history_timestamps: history.iter().map(|x| x.2).collect(),
                }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_trained_scorers_agree_on_random_batches(
            instances in proptest::collection::vec(mapped_instance(), 1..7),
            max_history_length in proptest::option::of(1usize..4),
            seed in 1u8..255,
        ) {
            let assembler = match max_history_length {
                Some(length) => BatchAssembler::new(0).max_history_length(length),
                None => BatchAssembler::new(0),
            };
            let batches = vec![assembler.assemble(&instances).unwrap()];

            let mut trainable = Hyperparameters::new(NUM_ITEMS, NUM_CATEGORIES)
                .embedding_dim(4)
                .learning_rate(0.05)
                .num_epochs(3)
                .loss(Loss::Logistic)
                .from_seed([seed; 16])
                .build();
            trainable.fit(&batches).unwrap();

            let frozen = artifact::load(artifact::export(&trainable)).unwrap();
            let report = check(&trainable, &frozen, &batches, 1e-4).unwrap();

            prop_assert_eq!(report.compared, instances.len());
            prop_assert!(report.is_consistent(), "{:?}", report);
        }
    }
}
