#![deny(missing_docs)]
//! # sbr-serving
//!
//! `sbr_serving` checks that a sequence-based recommender scores the same
//! way offline (on its trainable computation graph) and online (replayed
//! from a frozen, self-contained artifact).
//!
//! The pipeline reads a tab-delimited interaction log, maps raw identifiers
//! to dense indices, assembles padded batches, scores them with a trainable
//! model, exports the model, reloads it in an isolated frozen scorer and
//! compares the two sets of scores.
//!
//! ## Example
//!
//! ```rust,no_run
//! # extern crate sbr_serving;
//! use sbr_serving::batch::BatchAssembler;
//! use sbr_serving::consistency;
//! use sbr_serving::data::read_instances;
//! use sbr_serving::models::attention::Hyperparameters;
//! use sbr_serving::vocabulary::Vocabularies;
//!
//! let train = read_instances("train.tsv").unwrap();
//! let vocabularies = Vocabularies::build(&train);
//!
//! let assembler = BatchAssembler::new(4).max_history_length(50);
//! let mapped = vocabularies.map_all(&train);
//! let batches: Vec<_> = assembler.minibatches(&mapped, 250).collect::<Result<_, _>>().unwrap();
//!
//! let mut model = Hyperparameters::new(
//!     vocabularies.items().len(),
//!     vocabularies.categories().len(),
//! ).embedding_dim(18)
//!     .num_epochs(5)
//!     .build();
//! model.fit(&batches).unwrap();
//!
//! let report = consistency::run_file("test.tsv", &vocabularies, &assembler, &model, 1e-4)
//!     .unwrap();
//! assert!(report.is_consistent());
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;

pub mod artifact;
pub mod batch;
pub mod consistency;
pub mod data;
pub mod evaluation;
pub mod models;
pub mod vocabulary;

/// Alias for dense user, item and category indices.
pub type Index = usize;
/// Alias for timestamps.
pub type Timestamp = i64;

/// Index every unknown identifier maps to.
pub const UNKNOWN_INDEX: Index = 0;

/// Input data error types.
#[derive(Debug, Fail, PartialEq)]
pub enum DataError {
    /// A log line could not be parsed.
    #[fail(display = "Malformed record at line {}: {}", line, reason)]
    MalformedRecord {
        /// 1-based line number, 0 when parsing a lone line.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// A batch was requested from zero instances.
    #[fail(display = "Cannot assemble a batch from zero instances.")]
    EmptyBatch,
    /// A negative-sampling group does not start with a positive
    /// followed by negatives.
    #[fail(display = "Malformed negative sampling group at instance {}.", index)]
    MalformedGroup {
        /// Index of the first offending instance.
        index: usize,
    },
}

/// Artifact loading error types.
#[derive(Debug, Fail, PartialEq)]
pub enum ArtifactError {
    /// The artifact does not satisfy the expected scoring contract.
    #[fail(display = "Artifact version mismatch: {}", reason)]
    ArtifactVersionMismatch {
        /// What did not match.
        reason: String,
    },
}

/// Prediction error types.
#[derive(Debug, Fail, PartialEq)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The batch refers to an index the model has no parameters for.
    #[fail(display = "Index {} out of range for table {} with {} rows.", index, table, rows)]
    IndexOutOfRange {
        /// Parameter table name.
        table: String,
        /// Offending index.
        index: Index,
        /// Number of rows in the table.
        rows: usize,
    },
    /// Operand shapes are incompatible.
    #[fail(display = "Shape mismatch in {}: {:?} and {:?}.", op, lhs, rhs)]
    ShapeMismatch {
        /// Operation name.
        op: String,
        /// Shape of the left operand.
        lhs: (usize, usize),
        /// Shape of the right operand.
        rhs: (usize, usize),
    },
    /// A scoring program read a slot nothing has written.
    #[fail(display = "Slot {} is not defined.", name)]
    MissingSlot {
        /// Slot name.
        name: String,
    },
}

/// Fitting error types.
#[derive(Debug, Fail, PartialEq)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "No interactions were supplied.")]
    NoInteractions,
    /// A ranking loss was asked to fit a group that is not a positive
    /// followed by negatives.
    #[fail(display = "Malformed negative sampling group at instance {}.", index)]
    MalformedGroup {
        /// Index of the group's first instance across all batches.
        index: usize,
    },
    /// The hyperparameters cannot describe a trainable model.
    #[fail(display = "Invalid hyperparameters: {}", reason)]
    InvalidHyperparameters {
        /// Which hyperparameter is out of range.
        reason: String,
    },
    /// The training loss stopped being finite. Parameters are left as
    /// they were before the offending step.
    #[fail(display = "Training loss became non-finite in epoch {}.", epoch)]
    NonFiniteLoss {
        /// Zero-based epoch.
        epoch: usize,
    },
    /// Scoring failed during training.
    #[fail(display = "Scoring failed during training: {}", _0)]
    Prediction(#[cause] PredictionError),
}

impl From<PredictionError> for FittingError {
    fn from(error: PredictionError) -> Self {
        FittingError::Prediction(error)
    }
}
