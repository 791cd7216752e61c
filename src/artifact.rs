//! Exporting scorers to portable artifacts and loading them back.
//!
//! An artifact is a single JSON document holding named parameter tensors
//! and an ordered program of array operations. Replaying the program on
//! the inputs named by the artifact's [`ScoringContract`] reproduces the
//! exported scorer's output.
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use failure;
use ndarray::Array2;
use serde_json;

use crate::models::attention::TrainableScorer;
use crate::models::frozen::FrozenScorer;
use crate::models::ScoringContract;
use crate::ArtifactError;

/// Artifact layout version written by this crate.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

fn mismatch<T: Into<String>>(reason: T) -> ArtifactError {
    ArtifactError::ArtifactVersionMismatch {
        reason: reason.into(),
    }
}

/// A dense, row-major, two-dimensional parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// `(rows, columns)`.
    pub shape: (usize, usize),
    /// Values in row-major order.
    pub data: Vec<f32>,
}

impl Tensor {
    /// Copy an array.
    pub fn from_array(array: &Array2<f32>) -> Self {
        Tensor {
            shape: array.dim(),
            data: array.iter().cloned().collect(),
        }
    }

    /// Build an owned array from this tensor.
    pub fn to_array(&self) -> Result<Array2<f32>, ArtifactError> {
        Array2::from_shape_vec(self.shape, self.data.clone()).map_err(|_| {
            mismatch(format!(
                "tensor of shape {:?} holds {} values",
                self.shape,
                self.data.len()
            ))
        })
    }
}

/// A single step of a scoring program.
///
/// Every operation reads named slots and writes one new slot. Dense
/// operands may name contract inputs, parameters or earlier outputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Select the rows of parameter `table` named by the index input `indices`.
    Gather {
        /// Parameter name.
        table: String,
        /// Index input slot.
        indices: String,
        /// Output slot.
        output: String,
    },
    /// Elementwise sum of two equally-shaped values.
    Add {
        /// Left operand.
        lhs: String,
        /// Right operand.
        rhs: String,
        /// Output slot.
        output: String,
    },
    /// Elementwise product of two equally-shaped values.
    Mul {
        /// Left operand.
        lhs: String,
        /// Right operand.
        rhs: String,
        /// Output slot.
        output: String,
    },
    /// Matrix product.
    MatMul {
        /// Left operand.
        lhs: String,
        /// Right operand.
        rhs: String,
        /// Output slot.
        output: String,
    },
    /// Matrix transpose.
    Transpose {
        /// Operand.
        input: String,
        /// Output slot.
        output: String,
    },
    /// Elementwise logistic function.
    Sigmoid {
        /// Operand.
        input: String,
        /// Output slot.
        output: String,
    },
}

impl Op {
    /// The slot this operation writes.
    pub fn output(&self) -> &str {
        match self {
            Op::Gather { output, .. }
            | Op::Add { output, .. }
            | Op::Mul { output, .. }
            | Op::MatMul { output, .. }
            | Op::Transpose { output, .. }
            | Op::Sigmoid { output, .. } => output.as_str(),
        }
    }

    /// The dense slots this operation reads.
    pub fn dense_operands(&self) -> Vec<&str> {
        match self {
            Op::Gather { .. } => Vec::new(),
            Op::Add { lhs, rhs, .. } | Op::Mul { lhs, rhs, .. } | Op::MatMul { lhs, rhs, .. } => {
                vec![lhs.as_str(), rhs.as_str()]
            }
            Op::Transpose { input, .. } | Op::Sigmoid { input, .. } => vec![input.as_str()],
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Gather { .. } => "gather",
            Op::Add { .. } => "add",
            Op::Mul { .. } => "mul",
            Op::MatMul { .. } => "mat_mul",
            Op::Transpose { .. } => "transpose",
            Op::Sigmoid { .. } => "sigmoid",
        }
    }
}

/// A self-contained, versioned scoring function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringArtifact {
    /// Layout version; must equal [`ARTIFACT_FORMAT_VERSION`].
    pub format_version: u32,
    /// Names of the input and output slots.
    pub contract: ScoringContract,
    /// Scale applied to time deltas before their log transform.
    pub time_unit: f32,
    /// Named parameter values.
    pub parameters: BTreeMap<String, Tensor>,
    /// Operations to replay, in order.
    pub program: Vec<Op>,
}

impl ScoringArtifact {
    /// Check the artifact against the expected contract and make sure
    /// its program only reads values that exist by the time it runs.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(mismatch(format!(
                "format version {} is not the supported version {}",
                self.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }

        let expected = ScoringContract::default();
        if self.contract != expected {
            return Err(mismatch(format!(
                "contract {:?} does not match expected {:?}",
                self.contract, expected
            )));
        }

        if !(self.time_unit.is_finite() && self.time_unit > 0.0) {
            return Err(mismatch(format!("invalid time unit {}", self.time_unit)));
        }

        for (name, tensor) in &self.parameters {
            if tensor.shape.0.checked_mul(tensor.shape.1) != Some(tensor.data.len()) {
                return Err(mismatch(format!(
                    "parameter {} of shape {:?} holds {} values",
                    name,
                    tensor.shape,
                    tensor.data.len()
                )));
            }
        }

        let index_inputs: HashSet<&str> = self.contract.index_inputs().iter().cloned().collect();
        let mut reserved = index_inputs.clone();
        reserved.extend(self.parameters.keys().map(|x| x.as_str()));

        let mut available: HashSet<&str> = self.contract.dense_inputs().iter().cloned().collect();
        reserved.extend(available.iter().cloned());
        available.extend(self.parameters.keys().map(|x| x.as_str()));

        for (position, op) in self.program.iter().enumerate() {
            if let Op::Gather { table, indices, .. } = op {
                if !self.parameters.contains_key(table) {
                    return Err(mismatch(format!(
                        "op {} gathers from unknown table {}",
                        position, table
                    )));
                }
                if !index_inputs.contains(indices.as_str()) {
                    return Err(mismatch(format!(
                        "op {} gathers with unknown index input {}",
                        position, indices
                    )));
                }
            }

            for operand in op.dense_operands() {
                if !available.contains(operand) {
                    return Err(mismatch(format!(
                        "op {} ({}) reads undefined slot {}",
                        position,
                        op.name(),
                        operand
                    )));
                }
            }

            if reserved.contains(op.output()) {
                return Err(mismatch(format!(
                    "op {} overwrites input or parameter {}",
                    position,
                    op.output()
                )));
            }

            available.insert(op.output());
        }

        if !self
            .program
            .iter()
            .any(|op| op.output() == self.contract.score)
        {
            return Err(mismatch(format!(
                "program never writes output slot {}",
                self.contract.score
            )));
        }

        Ok(())
    }

    /// Write the artifact to a single JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), failure::Error> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;

        tracing::info!(
            "Saved artifact with {} parameters and {} ops to {}",
            self.parameters.len(),
            self.program.len(),
            path.as_ref().display()
        );

        Ok(())
    }

    /// Read an artifact written by [`save`](#method.save).
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let reader = BufReader::new(File::open(path)?);
        let artifact = serde_json::from_reader(reader)?;

        Ok(artifact)
    }
}

/// Capture a trainable scorer's current parameters and scoring program.
pub fn export(scorer: &TrainableScorer) -> ScoringArtifact {
    scorer.export()
}

/// Build a frozen scorer from an artifact, validating it first.
pub fn load(artifact: ScoringArtifact) -> Result<FrozenScorer, ArtifactError> {
    FrozenScorer::load(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::attention::Hyperparameters;

    fn artifact() -> ScoringArtifact {
        Hyperparameters::new(10, 4)
            .embedding_dim(3)
            .from_seed([7; 16])
            .build()
            .export()
    }

    fn expect_mismatch(artifact: ScoringArtifact, needle: &str) {
        match artifact.validate() {
            Err(ArtifactError::ArtifactVersionMismatch { reason }) => {
                assert!(reason.contains(needle), "{} does not mention {}", reason, needle)
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn exported_artifact_is_valid() {
        let artifact = artifact();

        assert!(artifact.validate().is_ok());
        assert_eq!(artifact.parameters["item_embedding"].shape, (10, 3));
        assert_eq!(artifact.parameters["category_embedding"].shape, (4, 3));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut artifact = artifact();
        artifact.format_version += 1;

        expect_mismatch(artifact, "format version");
    }

    #[test]
    fn renamed_slot_is_rejected() {
        let mut artifact = artifact();
        artifact.contract.history_items = "hist_items".to_owned();

        expect_mismatch(artifact, "contract");
    }

    #[test]
    fn missing_output_is_rejected() {
        let mut artifact = artifact();
        artifact.program.pop();

        expect_mismatch(artifact, "never writes");
    }

    #[test]
    fn undefined_operand_is_rejected() {
        let mut artifact = artifact();
        artifact.program.insert(
            0,
            Op::Sigmoid {
                input: "logit".to_owned(),
                output: "early".to_owned(),
            },
        );

        expect_mismatch(artifact, "undefined slot logit");
    }

    #[test]
    fn overwriting_a_parameter_is_rejected() {
        let mut artifact = artifact();
        artifact.program.push(Op::Sigmoid {
            input: "score".to_owned(),
            output: "item_bias".to_owned(),
        });

        expect_mismatch(artifact, "overwrites");
    }

    #[test]
    fn truncated_tensor_is_rejected() {
        let mut artifact = artifact();
        artifact
            .parameters
            .get_mut("item_bias")
            .unwrap()
            .data
            .pop();

        expect_mismatch(artifact, "item_bias");
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let mut artifact = artifact();
        artifact
            .parameters
            .get_mut("item_embedding")
            .unwrap()
            .shape = (usize::max_value(), 2);

        expect_mismatch(artifact, "item_embedding");
    }

    #[test]
    fn save_and_read() {
        let artifact = artifact();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        artifact.save(&path).unwrap();

        assert_eq!(ScoringArtifact::read(&path).unwrap(), artifact);
    }

    #[test]
    fn ops_serialize_with_tags() {
        let op = Op::MatMul {
            lhs: "a".to_owned(),
            rhs: "b".to_owned(),
            output: "c".to_owned(),
        };

        let json = serde_json::to_string(&op).unwrap();

        assert!(json.contains(r#""op":"mat_mul""#));
        assert_eq!(serde_json::from_str::<Op>(&json).unwrap(), op);
    }
}
