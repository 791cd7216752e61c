//! Models module.
//!
//! Both scorers consume a [`Batch`](../batch/struct.Batch.html) one instance
//! at a time through [`ScoringInputs`](struct.ScoringInputs.html), whose
//! fields correspond one-to-one to the slots of the
//! [`ScoringContract`](struct.ScoringContract.html).
use std::collections::HashMap;

use ndarray::Array2;

use crate::batch::Batch;
use crate::{Index, PredictionError};

pub mod attention;
pub mod frozen;

/// The loss used for training the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Loss {
    /// Pointwise logistic loss on every instance.
    Logistic,
    /// Bayesian Personalised Ranking of each group's positive
    /// against its negatives.
    BPR,
}

/// Optimizer used to train the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Optimizer {
    /// Adagrad.
    Adagrad,
    /// Adam.
    Adam,
}

/// Names of every input and output slot of a scoring function.
///
/// Artifacts carry their own contract; a frozen scorer only loads
/// artifacts whose contract equals [`ScoringContract::default`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringContract {
    /// Target item index.
    pub items: String,
    /// Target category index.
    pub categories: String,
    /// Padded history item indices.
    pub history_items: String,
    /// Padded history category indices.
    pub history_categories: String,
    /// History validity mask.
    pub mask: String,
    /// Transformed time since the first history entry.
    pub time_since_first: String,
    /// Transformed time until the scored event.
    pub time_to_now: String,
    /// Output score.
    pub score: String,
}

impl Default for ScoringContract {
    fn default() -> Self {
        ScoringContract {
            items: "items".to_owned(),
            categories: "categories".to_owned(),
            history_items: "history_items".to_owned(),
            history_categories: "history_categories".to_owned(),
            mask: "mask".to_owned(),
            time_since_first: "time_since_first".to_owned(),
            time_to_now: "time_to_now".to_owned(),
            score: "score".to_owned(),
        }
    }
}

impl ScoringContract {
    /// Slots holding index inputs.
    pub fn index_inputs(&self) -> [&str; 4] {
        [
            self.items.as_str(),
            self.categories.as_str(),
            self.history_items.as_str(),
            self.history_categories.as_str(),
        ]
    }

    /// Slots holding dense inputs.
    pub fn dense_inputs(&self) -> [&str; 3] {
        [
            self.mask.as_str(),
            self.time_since_first.as_str(),
            self.time_to_now.as_str(),
        ]
    }
}

/// Model inputs for a single instance of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoringInputs {
    /// Target item index.
    pub item: Index,
    /// Target category index.
    pub category: Index,
    /// History item indices, at least one entry wide.
    pub history_items: Vec<Index>,
    /// History category indices.
    pub history_categories: Vec<Index>,
    /// `1.0` at real history positions, `0.0` at padding; a column.
    pub mask: Array2<f32>,
    /// `ln(1 + Δ / time_unit)` of the time since the first entry; a column.
    pub time_since_first: Array2<f32>,
    /// `ln(1 + Δ / time_unit)` of the time until the scored event; a column.
    pub time_to_now: Array2<f32>,
}

impl ScoringInputs {
    /// Extract the inputs of instance `row`.
    ///
    /// A batch whose instances all lack history still yields a single
    /// masked padding position, so the history arrays are never empty.
    pub fn from_batch(batch: &Batch, row: usize, time_unit: f32) -> Self {
        let width = batch.max_history_length();
        let padded_width = width.max(1);
        let offset = padded_width - width;

        let mut history_items = vec![0; padded_width];
        let mut history_categories = vec![0; padded_width];
        let mut mask = Array2::zeros((padded_width, 1));
        let mut time_since_first = Array2::zeros((padded_width, 1));
        let mut time_to_now = Array2::zeros((padded_width, 1));

        let transform = |delta: f32| (delta / time_unit).ln_1p();

        for column in 0..width {
            let position = offset + column;

            history_items[position] = batch.history_item_ids()[(row, column)];
            history_categories[position] = batch.history_category_ids()[(row, column)];
            mask[(position, 0)] = if batch.mask()[(row, column)] { 1.0 } else { 0.0 };
            time_since_first[(position, 0)] = transform(batch.time_since_first()[(row, column)]);
            time_to_now[(position, 0)] = transform(batch.time_to_now()[(row, column)]);
        }

        ScoringInputs {
            item: batch.item_ids()[row],
            category: batch.category_ids()[row],
            history_items,
            history_categories,
            mask,
            time_since_first,
            time_to_now,
        }
    }
}

/// Per-caller execution state for scoring.
///
/// Callers own their context and pass it to every
/// [`Scorer::score`](trait.Scorer.html#tymethod.score) call; nothing is
/// shared between contexts.
#[derive(Debug, Default)]
pub struct ScoringContext {
    slots: HashMap<String, Array2<f32>>,
    instances_scored: usize,
    batches_scored: usize,
}

impl ScoringContext {
    /// Build an empty context.
    pub fn new() -> Self {
        ScoringContext::default()
    }

    /// Dense intermediate values of the last scored instance.
    pub fn slots(&self) -> &HashMap<String, Array2<f32>> {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut HashMap<String, Array2<f32>> {
        &mut self.slots
    }

    /// Number of instances scored with this context.
    pub fn instances_scored(&self) -> usize {
        self.instances_scored
    }

    /// Number of batches scored with this context.
    pub fn batches_scored(&self) -> usize {
        self.batches_scored
    }

    pub(crate) fn record_batch(&mut self, batch: &Batch) {
        self.instances_scored += batch.len();
        self.batches_scored += 1;
    }
}

/// Trait describing scoring functions over batches.
pub trait Scorer {
    /// The input and output slots this scorer reads and writes.
    fn contract(&self) -> &ScoringContract;
    /// Return one score per instance of `batch`, in input order.
    fn score(
        &self,
        context: &mut ScoringContext,
        batch: &Batch,
    ) -> Result<Vec<f32>, PredictionError>;
}

pub(crate) fn check_finite(score: f32) -> Result<f32, PredictionError> {
    if score.is_finite() {
        Ok(score)
    } else {
        Err(PredictionError::InvalidPredictionValue)
    }
}
