//! Attention-gated history model.
//!
//! The model estimates item and category embeddings, item biases and
//! two scalar weights for the time features. Target and history entries
//! are represented by the sum of their item and category embeddings.
//!
//! Each history position is gated by how well it matches the target and
//! by how old it is:
//! ```text
//! gate_j = sigmoid(h_j · t + w_first * since_first_j + w_now * to_now_j) * mask_j
//! u      = sum_j gate_j * h_j
//! score  = sigmoid(u · t + b_item)
//! ```
//! where `h_j` is the embedding of history entry `j` and `t` the
//! embedding of the target.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use failure;
use rand::distributions::{Distribution, Normal};
use rand::{Rng, SeedableRng, XorShiftRng};
use serde_json;

use wyrm;
use wyrm::optim::{Optimizer as Optim, Optimizers};
use wyrm::{Arr, BoxedNode, Variable};

use super::{check_finite, Loss, Optimizer, Scorer, ScoringContext, ScoringContract, ScoringInputs};
use crate::artifact::{Op, ScoringArtifact, Tensor, ARTIFACT_FORMAT_VERSION};
use crate::batch::{Batch, BatchAssembler};
use crate::{FittingError, PredictionError};

pub(crate) const ITEM_EMBEDDING: &str = "item_embedding";
pub(crate) const CATEGORY_EMBEDDING: &str = "category_embedding";
pub(crate) const ITEM_BIAS: &str = "item_bias";
pub(crate) const TIME_SINCE_FIRST_WEIGHT: &str = "time_since_first_weight";
pub(crate) const TIME_TO_NOW_WEIGHT: &str = "time_to_now_weight";

fn embedding_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> wyrm::Arr {
    let normal = Normal::new(0.0, 1.0 / cols as f64);
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

/// Keeps the logistic loss finite once a logit saturates.
const LOG_EPSILON: f32 = 1e-7;

/// Hyperparameters describing the attention model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    num_items: usize,
    num_categories: usize,
    embedding_dim: usize,
    learning_rate: f32,
    l2_penalty: f32,
    loss: Loss,
    optimizer: Optimizer,
    num_epochs: usize,
    seed: [u8; 16],
    max_history_length: usize,
    negatives_per_positive: usize,
    batch_size: usize,
    time_unit: f32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new(1, 1)
    }
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new(num_items: usize, num_categories: usize) -> Self {
        Hyperparameters {
            num_items,
            num_categories,
            embedding_dim: 18,
            learning_rate: 0.001,
            l2_penalty: 0.0001,
            loss: Loss::Logistic,
            optimizer: Optimizer::Adam,
            num_epochs: 10,
            seed: [42; 16],
            max_history_length: 50,
            negatives_per_positive: 4,
            batch_size: 400,
            time_unit: 3600.0,
        }
    }

    /// Parse hyperparameters from a JSON document. Missing fields
    /// take their default values.
    pub fn from_json(json: &str) -> Result<Self, failure::Error> {
        let hyper: Hyperparameters = serde_json::from_str(json)?;
        hyper.validate()?;

        Ok(hyper)
    }

    /// Read hyperparameters from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        Hyperparameters::from_json(&fs::read_to_string(path)?)
    }

    /// Set the number of item embedding rows.
    pub fn num_items(mut self, num_items: usize) -> Self {
        self.num_items = num_items;
        self
    }

    /// Set the number of category embedding rows.
    pub fn num_categories(mut self, num_categories: usize) -> Self {
        self.num_categories = num_categories;
        self
    }

    /// Set the embedding dimensionality.
    pub fn embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// Set the loss function.
    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    /// Set the optimizer type.
    pub fn optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set the number of epochs to run per each `fit` call.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the random number generator seed used to initialise parameters.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.seed = seed;
        self
    }

    /// Set the number of most recent history entries kept per instance.
    pub fn max_history_length(mut self, max_history_length: usize) -> Self {
        self.max_history_length = max_history_length;
        self
    }

    /// Set the number of negatives following each positive.
    pub fn negatives_per_positive(mut self, negatives_per_positive: usize) -> Self {
        self.negatives_per_positive = negatives_per_positive;
        self
    }

    /// Set the number of instances per batch.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the scale of time deltas, in timestamp units.
    pub fn time_unit(mut self, time_unit: f32) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Check that the hyperparameters describe a model that can be fitted.
    pub fn validate(&self) -> Result<(), FittingError> {
        let invalid = |reason: &str| {
            Err(FittingError::InvalidHyperparameters {
                reason: reason.to_owned(),
            })
        };

        if !(self.time_unit.is_finite() && self.time_unit > 0.0) {
            return invalid("time_unit must be finite and positive");
        }
        if self.embedding_dim == 0 {
            return invalid("embedding_dim must be positive");
        }
        if self.num_epochs == 0 {
            return invalid("num_epochs must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be finite and positive");
        }
        if !(self.l2_penalty.is_finite() && self.l2_penalty >= 0.0) {
            return invalid("l2_penalty must be finite and non-negative");
        }

        Ok(())
    }

    /// Instances per batch.
    pub fn get_batch_size(&self) -> usize {
        self.batch_size
    }

    /// The batch assembler matching these hyperparameters.
    pub fn assembler(&self) -> BatchAssembler {
        BatchAssembler::new(self.negatives_per_positive).max_history_length(self.max_history_length)
    }

    fn build_params(&self) -> Parameters {
        let mut rng = XorShiftRng::from_seed(self.seed);

        let item_embedding = embedding_init(self.num_items, self.embedding_dim, &mut rng);
        let category_embedding = embedding_init(self.num_categories, self.embedding_dim, &mut rng);

        Parameters {
            item_embedding: Arc::new(wyrm::HogwildParameter::new(item_embedding)),
            category_embedding: Arc::new(wyrm::HogwildParameter::new(category_embedding)),
            item_bias: Arc::new(wyrm::HogwildParameter::new(Arr::zeros((self.num_items, 1)))),
            time_since_first_weight: Arc::new(wyrm::HogwildParameter::new(Arr::zeros((1, 1)))),
            time_to_now_weight: Arc::new(wyrm::HogwildParameter::new(Arr::zeros((1, 1)))),
        }
    }

    /// Build the trainable scorer.
    pub fn build(self) -> TrainableScorer {
        let params = self.build_params();

        TrainableScorer {
            hyper: self,
            contract: ScoringContract::default(),
            params,
        }
    }
}

#[derive(Debug)]
struct Parameters {
    item_embedding: Arc<wyrm::HogwildParameter>,
    category_embedding: Arc<wyrm::HogwildParameter>,
    item_bias: Arc<wyrm::HogwildParameter>,
    time_since_first_weight: Arc<wyrm::HogwildParameter>,
    time_to_now_weight: Arc<wyrm::HogwildParameter>,
}

impl Clone for Parameters {
    fn clone(&self) -> Self {
        Parameters {
            item_embedding: Arc::new(self.item_embedding.as_ref().clone()),
            category_embedding: Arc::new(self.category_embedding.as_ref().clone()),
            item_bias: Arc::new(self.item_bias.as_ref().clone()),
            time_since_first_weight: Arc::new(self.time_since_first_weight.as_ref().clone()),
            time_to_now_weight: Arc::new(self.time_to_now_weight.as_ref().clone()),
        }
    }
}

impl Parameters {
    fn named(&self) -> [(&'static str, &Arc<wyrm::HogwildParameter>); 5] {
        [
            (ITEM_EMBEDDING, &self.item_embedding),
            (CATEGORY_EMBEDDING, &self.category_embedding),
            (ITEM_BIAS, &self.item_bias),
            (TIME_SINCE_FIRST_WEIGHT, &self.time_since_first_weight),
            (TIME_TO_NOW_WEIGHT, &self.time_to_now_weight),
        ]
    }

    fn build(&self) -> Graph {
        Graph {
            item_embedding: wyrm::ParameterNode::shared(self.item_embedding.clone()),
            category_embedding: wyrm::ParameterNode::shared(self.category_embedding.clone()),
            item_bias: wyrm::ParameterNode::shared(self.item_bias.clone()),
            time_since_first_weight: wyrm::ParameterNode::shared(
                self.time_since_first_weight.clone(),
            ),
            time_to_now_weight: wyrm::ParameterNode::shared(self.time_to_now_weight.clone()),
        }
    }

    fn check_indices(&self, batch: &Batch) -> Result<(), PredictionError> {
        let num_items = self.item_embedding.value().rows();
        let num_categories = self.category_embedding.value().rows();

        let out_of_range = |table: &str, index: usize, rows: usize| {
            if index < rows {
                Ok(())
            } else {
                Err(PredictionError::IndexOutOfRange {
                    table: table.to_owned(),
                    index,
                    rows,
                })
            }
        };

        for &index in batch.item_ids().iter().chain(batch.history_item_ids().iter()) {
            out_of_range(ITEM_EMBEDDING, index, num_items)?;
        }
        for &index in batch
            .category_ids()
            .iter()
            .chain(batch.history_category_ids().iter())
        {
            out_of_range(CATEGORY_EMBEDDING, index, num_categories)?;
        }

        Ok(())
    }
}

/// Parameter nodes of one computation graph.
struct Graph {
    item_embedding: Variable<wyrm::ParameterNode>,
    category_embedding: Variable<wyrm::ParameterNode>,
    item_bias: Variable<wyrm::ParameterNode>,
    time_since_first_weight: Variable<wyrm::ParameterNode>,
    time_to_now_weight: Variable<wyrm::ParameterNode>,
}

impl Graph {
    /// The pre-sigmoid score of a single instance.
    fn logit(&self, inputs: &ScoringInputs) -> Variable<BoxedNode> {
        let item = wyrm::IndexInputNode::new(&[inputs.item]);
        let category = wyrm::IndexInputNode::new(&[inputs.category]);
        let history_items = wyrm::IndexInputNode::new(&inputs.history_items);
        let history_categories = wyrm::IndexInputNode::new(&inputs.history_categories);
        let mask = wyrm::InputNode::new(inputs.mask.clone());
        let time_since_first = wyrm::InputNode::new(inputs.time_since_first.clone());
        let time_to_now = wyrm::InputNode::new(inputs.time_to_now.clone());

        let target =
            (self.item_embedding.index(&item) + self.category_embedding.index(&category)).boxed();
        let history = (self.item_embedding.index(&history_items)
            + self.category_embedding.index(&history_categories))
            .boxed();
        let target_t = target.t().boxed();

        let relevance = history.dot(&target_t);
        let recency = time_since_first.dot(&self.time_since_first_weight);
        let staleness = time_to_now.dot(&self.time_to_now_weight);

        let gate = ((relevance + recency + staleness).sigmoid() * mask).boxed();
        let user = gate.t().dot(&history);

        (user.dot(&target_t) + self.item_bias.index(&item)).boxed()
    }
}

/// Reject a loss that would corrupt the parameters if stepped on.
fn check_loss(loss: f32, epoch: usize) -> Result<f32, FittingError> {
    if loss.is_finite() {
        Ok(loss)
    } else {
        Err(FittingError::NonFiniteLoss { epoch })
    }
}

/// The program replaying [`Graph::logit`] followed by a sigmoid.
fn program(contract: &ScoringContract) -> Vec<Op> {
    let slot = |name: &str| name.to_owned();
    let gather = |table: &str, indices: &str, output: &str| Op::Gather {
        table: slot(table),
        indices: slot(indices),
        output: slot(output),
    };
    let add = |lhs: &str, rhs: &str, output: &str| Op::Add {
        lhs: slot(lhs),
        rhs: slot(rhs),
        output: slot(output),
    };
    let mat_mul = |lhs: &str, rhs: &str, output: &str| Op::MatMul {
        lhs: slot(lhs),
        rhs: slot(rhs),
        output: slot(output),
    };

    vec![
        gather(ITEM_EMBEDDING, &contract.items, "target_item"),
        gather(CATEGORY_EMBEDDING, &contract.categories, "target_category"),
        add("target_item", "target_category", "target"),
        gather(ITEM_EMBEDDING, &contract.history_items, "history_item"),
        gather(
            CATEGORY_EMBEDDING,
            &contract.history_categories,
            "history_category",
        ),
        add("history_item", "history_category", "history"),
        Op::Transpose {
            input: slot("target"),
            output: slot("target_t"),
        },
        mat_mul("history", "target_t", "relevance"),
        mat_mul(&contract.time_since_first, TIME_SINCE_FIRST_WEIGHT, "recency"),
        mat_mul(&contract.time_to_now, TIME_TO_NOW_WEIGHT, "staleness"),
        add("relevance", "recency", "gate_partial"),
        add("gate_partial", "staleness", "gate_logit"),
        Op::Sigmoid {
            input: slot("gate_logit"),
            output: slot("gate_unmasked"),
        },
        Op::Mul {
            lhs: slot("gate_unmasked"),
            rhs: slot(&contract.mask),
            output: slot("gate"),
        },
        Op::Transpose {
            input: slot("gate"),
            output: slot("gate_t"),
        },
        mat_mul("gate_t", "history", "user"),
        mat_mul("user", "target_t", "affinity"),
        gather(ITEM_BIAS, &contract.items, "bias"),
        add("affinity", "bias", "logit"),
        Op::Sigmoid {
            input: slot("logit"),
            output: slot(&contract.score),
        },
    ]
}

/// Trainable attention scorer.
///
/// Parameters live in shared hogwild storage updated in place by
/// [`fit`](#method.fit); every scoring call builds a fresh graph over them.
#[derive(Debug, Clone)]
pub struct TrainableScorer {
    hyper: Hyperparameters,
    contract: ScoringContract,
    params: Parameters,
}

impl TrainableScorer {
    /// The hyperparameters the scorer was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    fn inputs(&self, batch: &Batch) -> Vec<ScoringInputs> {
        (0..batch.len())
            .map(|row| ScoringInputs::from_batch(batch, row, self.hyper.time_unit))
            .collect()
    }

    fn optimizer(&self) -> Optimizers {
        match self.hyper.optimizer {
            Optimizer::Adagrad => Optimizers::Adagrad(
                wyrm::optim::Adagrad::new()
                    .learning_rate(self.hyper.learning_rate)
                    .l2_penalty(self.hyper.l2_penalty),
            ),
            Optimizer::Adam => Optimizers::Adam(
                wyrm::optim::Adam::new()
                    .learning_rate(self.hyper.learning_rate)
                    .l2_penalty(self.hyper.l2_penalty),
            ),
        }
    }

    fn group_loss(
        &self,
        graph: &Graph,
        inputs: &[ScoringInputs],
        labels: &[bool],
    ) -> Vec<Variable<BoxedNode>> {
        match self.hyper.loss {
            Loss::Logistic => izip!(inputs, labels)
                .map(|(inputs, &label)| {
                    let sign = wyrm::InputNode::new(Arr::from_elem(
                        (1, 1),
                        if label { 1.0 } else { -1.0 },
                    ));
                    let likelihood = LOG_EPSILON + (graph.logit(inputs) * sign).sigmoid();
                    (0.0 - likelihood.ln()).boxed()
                })
                .collect(),
            Loss::BPR => {
                let positive = graph.logit(&inputs[0]);

                inputs[1..]
                    .iter()
                    .map(|negative| (graph.logit(negative) - positive.clone()).sigmoid().boxed())
                    .collect()
            }
        }
    }

    /// Fit the model on batches of instances, in order.
    ///
    /// With the BPR loss, every batch must consist of whole groups of one
    /// positive followed by `negatives_per_positive` negatives. Returns the
    /// mean loss of the last epoch.
    pub fn fit(&mut self, batches: &[Batch]) -> Result<f32, FittingError> {
        self.hyper.validate()?;

        let num_instances: usize = batches.iter().map(|batch| batch.len()).sum();

        if num_instances == 0 {
            return Err(FittingError::NoInteractions);
        }

        let group_size = match self.hyper.loss {
            Loss::Logistic => 1,
            Loss::BPR => 1 + self.hyper.negatives_per_positive,
        };

        let optimizer = self.optimizer();
        let mut epoch_loss = 0.0;

        for epoch in 0..self.hyper.num_epochs {
            let mut loss_value = 0.0;
            let mut examples = 0;
            let mut offset = 0;

            for batch in batches {
                self.params.check_indices(batch)?;

                let inputs = self.inputs(batch);
                let labels = batch.labels();

                for (group_idx, (group_inputs, group_labels)) in inputs
                    .chunks(group_size)
                    .zip(labels.chunks(group_size))
                    .enumerate()
                {
                    if self.hyper.loss == Loss::BPR {
                        let well_formed = group_labels.len() == group_size
                            && group_labels
                                .iter()
                                .enumerate()
                                .all(|(idx, &label)| label == (idx == 0));

                        if !well_formed {
                            return Err(FittingError::MalformedGroup {
                                index: offset + group_idx * group_size,
                            });
                        }
                    }

                    let graph = self.params.build();
                    let terms = self.group_loss(&graph, group_inputs, group_labels);

                    if terms.is_empty() {
                        continue;
                    }

                    let mut loss = terms[0].clone();
                    for term in &terms[1..] {
                        loss = (loss + term.clone()).boxed();
                    }

                    loss.forward();
                    loss_value += check_loss(loss.value().scalar_sum(), epoch)?;
                    examples += terms.len();

                    loss.backward(1.0);
                    optimizer.step(loss.parameters());
                }

                offset += batch.len();
            }

            epoch_loss = check_loss(loss_value / (1.0 + examples as f32), epoch)?;
            tracing::debug!("Epoch {}: loss {}", epoch, epoch_loss);
        }

        tracing::info!(
            "Fitted {} instances for {} epochs, final loss {}",
            num_instances,
            self.hyper.num_epochs,
            epoch_loss
        );

        Ok(epoch_loss)
    }

    /// Capture current parameter values and the scoring program.
    ///
    /// Optimizer state is not part of the model and never exported.
    pub fn export(&self) -> ScoringArtifact {
        let parameters: BTreeMap<String, Tensor> = self
            .params
            .named()
            .iter()
            .map(|&(name, param)| (name.to_owned(), Tensor::from_array(param.value())))
            .collect();

        ScoringArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            contract: self.contract.clone(),
            time_unit: self.hyper.time_unit,
            parameters,
            program: program(&self.contract),
        }
    }
}

impl Scorer for TrainableScorer {
    fn contract(&self) -> &ScoringContract {
        &self.contract
    }

    fn score(
        &self,
        context: &mut ScoringContext,
        batch: &Batch,
    ) -> Result<Vec<f32>, PredictionError> {
        self.params.check_indices(batch)?;

        let scores = self
            .inputs(batch)
            .iter()
            .map(|inputs| {
                let graph = self.params.build();
                let score = graph.logit(inputs).sigmoid();

                score.forward();
                let value = score.value()[(0, 0)];

                check_finite(value)
            })
            .collect::<Result<Vec<_>, _>>()?;

        context.record_batch(batch);

        Ok(scores)
    }
}
