//! Frozen scorer replaying an exported artifact.
//!
//! The scorer owns its own copy of every parameter and evaluates the
//! artifact's program on plain arrays, so it shares no state with the
//! model it was exported from.
use std::collections::HashMap;

use ndarray::Axis;
use wyrm::Arr;

use super::{check_finite, Scorer, ScoringContext, ScoringContract, ScoringInputs};
use crate::artifact::{Op, ScoringArtifact};
use crate::batch::Batch;
use crate::{ArtifactError, Index, PredictionError};

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn shape_mismatch(op: &Op, lhs: &Arr, rhs: &Arr) -> PredictionError {
    PredictionError::ShapeMismatch {
        op: op.name().to_owned(),
        lhs: lhs.dim(),
        rhs: rhs.dim(),
    }
}

/// Immutable scorer loaded from a [`ScoringArtifact`].
#[derive(Clone, Debug)]
pub struct FrozenScorer {
    contract: ScoringContract,
    time_unit: f32,
    parameters: HashMap<String, Arr>,
    program: Vec<Op>,
}

impl FrozenScorer {
    /// Validate the artifact and build a scorer from it.
    ///
    /// Besides the static checks of
    /// [`ScoringArtifact::validate`](../../artifact/struct.ScoringArtifact.html#method.validate),
    /// the program is run on placeholder inputs of two history widths;
    /// programs that fail on them or do not produce a single score are
    /// rejected here rather than at scoring time.
    pub fn load(artifact: ScoringArtifact) -> Result<Self, ArtifactError> {
        artifact.validate()?;

        let parameters = artifact
            .parameters
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.to_array()?)))
            .collect::<Result<HashMap<_, _>, ArtifactError>>()?;

        let scorer = FrozenScorer {
            contract: artifact.contract,
            time_unit: artifact.time_unit,
            parameters,
            program: artifact.program,
        };

        scorer.trial_run()?;

        tracing::info!(
            "Loaded frozen scorer with {} parameters and {} ops",
            scorer.parameters.len(),
            scorer.program.len()
        );

        Ok(scorer)
    }

    fn trial_run(&self) -> Result<(), ArtifactError> {
        let mut slots = HashMap::new();

        for &width in &[1, 2] {
            let inputs = ScoringInputs {
                item: 0,
                category: 0,
                history_items: vec![0; width],
                history_categories: vec![0; width],
                mask: Arr::ones((width, 1)),
                time_since_first: Arr::zeros((width, 1)),
                time_to_now: Arr::zeros((width, 1)),
            };

            self.run(&mut slots, &inputs).map_err(|error| {
                ArtifactError::ArtifactVersionMismatch {
                    reason: format!(
                        "program fails on inputs with history width {}: {}",
                        width, error
                    ),
                }
            })?;
        }

        Ok(())
    }

    /// Time unit the artifact was exported with.
    pub fn time_unit(&self) -> f32 {
        self.time_unit
    }

    fn indices<'a>(&self, inputs: &'a ScoringInputs, name: &str) -> Option<&'a [Index]> {
        let contract = &self.contract;

        if name == contract.items {
            Some(std::slice::from_ref(&inputs.item))
        } else if name == contract.categories {
            Some(std::slice::from_ref(&inputs.category))
        } else if name == contract.history_items {
            Some(&inputs.history_items)
        } else if name == contract.history_categories {
            Some(&inputs.history_categories)
        } else {
            None
        }
    }

    fn value<'a>(
        &'a self,
        slots: &'a HashMap<String, Arr>,
        name: &str,
    ) -> Result<&'a Arr, PredictionError> {
        slots
            .get(name)
            .or_else(|| self.parameters.get(name))
            .ok_or_else(|| PredictionError::MissingSlot {
                name: name.to_owned(),
            })
    }

    fn apply(
        &self,
        op: &Op,
        slots: &HashMap<String, Arr>,
        inputs: &ScoringInputs,
    ) -> Result<Arr, PredictionError> {
        let output = match op {
            Op::Gather { table, indices, .. } => {
                let table_value = self.value(slots, table)?;
                let indices = self
                    .indices(inputs, indices)
                    .ok_or_else(|| PredictionError::MissingSlot {
                        name: indices.clone(),
                    })?;

                let rows = table_value.rows();
                if let Some(&index) = indices.iter().find(|&&index| index >= rows) {
                    return Err(PredictionError::IndexOutOfRange {
                        table: table.clone(),
                        index,
                        rows,
                    });
                }

                table_value.select(Axis(0), indices)
            }
            Op::Add { lhs, rhs, .. } | Op::Mul { lhs, rhs, .. } => {
                let lhs = self.value(slots, lhs)?;
                let rhs = self.value(slots, rhs)?;

                if lhs.dim() != rhs.dim() {
                    return Err(shape_mismatch(op, lhs, rhs));
                }

                match op {
                    Op::Add { .. } => lhs + rhs,
                    _ => lhs * rhs,
                }
            }
            Op::MatMul { lhs, rhs, .. } => {
                let lhs = self.value(slots, lhs)?;
                let rhs = self.value(slots, rhs)?;

                if lhs.cols() != rhs.rows() {
                    return Err(shape_mismatch(op, lhs, rhs));
                }

                lhs.dot(rhs)
            }
            Op::Transpose { input, .. } => self.value(slots, input)?.t().to_owned(),
            Op::Sigmoid { input, .. } => self.value(slots, input)?.mapv(sigmoid),
        };

        Ok(output)
    }

    /// Run the program for a single instance, leaving every dense value
    /// it produced in `slots`.
    fn run(
        &self,
        slots: &mut HashMap<String, Arr>,
        inputs: &ScoringInputs,
    ) -> Result<f32, PredictionError> {
        slots.clear();
        slots.insert(self.contract.mask.clone(), inputs.mask.clone());
        slots.insert(
            self.contract.time_since_first.clone(),
            inputs.time_since_first.clone(),
        );
        slots.insert(
            self.contract.time_to_now.clone(),
            inputs.time_to_now.clone(),
        );

        for op in &self.program {
            let output = self.apply(op, slots, inputs)?;
            slots.insert(op.output().to_owned(), output);
        }

        let score = self.value(slots, &self.contract.score)?;
        if score.dim() != (1, 1) {
            return Err(PredictionError::ShapeMismatch {
                op: self.contract.score.clone(),
                lhs: score.dim(),
                rhs: (1, 1),
            });
        }

        check_finite(score[(0, 0)])
    }
}

impl Scorer for FrozenScorer {
    fn contract(&self) -> &ScoringContract {
        &self.contract
    }

    fn score(
        &self,
        context: &mut ScoringContext,
        batch: &Batch,
    ) -> Result<Vec<f32>, PredictionError> {
        let mut scores = Vec::with_capacity(batch.len());

        for row in 0..batch.len() {
            let inputs = ScoringInputs::from_batch(batch, row, self.time_unit);
            scores.push(self.run(context.slots_mut(), &inputs)?);
        }

        context.record_batch(batch);

        Ok(scores)
    }
}
