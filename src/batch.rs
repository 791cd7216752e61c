//! Assembling mapped instances into padded batches.
use ndarray::Array2;

use crate::data::MappedInstance;
use crate::vocabulary::check_mapped;
use crate::{DataError, Index, UNKNOWN_INDEX};

/// A batch of instances with their histories left-padded to a common width.
///
/// Row `i` of every array belongs to `instances()[i]`; column `j` of the
/// history arrays is history position `j` after padding.
#[derive(Clone, Debug)]
pub struct Batch {
    instances: Vec<MappedInstance>,
    item_ids: Vec<Index>,
    category_ids: Vec<Index>,
    history_item_ids: Array2<Index>,
    history_category_ids: Array2<Index>,
    mask: Array2<bool>,
    time_since_first: Array2<f32>,
    time_to_now: Array2<f32>,
}

impl Batch {
    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Batches are never empty, but mirror the `len` convention.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Padded history width.
    pub fn max_history_length(&self) -> usize {
        self.mask.cols()
    }

    /// The instances, in input order.
    pub fn instances(&self) -> &[MappedInstance] {
        &self.instances
    }

    /// Target item indices.
    pub fn item_ids(&self) -> &[Index] {
        &self.item_ids
    }

    /// Target category indices.
    pub fn category_ids(&self) -> &[Index] {
        &self.category_ids
    }

    /// History item indices, `len × max_history_length`.
    pub fn history_item_ids(&self) -> &Array2<Index> {
        &self.history_item_ids
    }

    /// History category indices, `len × max_history_length`.
    pub fn history_category_ids(&self) -> &Array2<Index> {
        &self.history_category_ids
    }

    /// Whether each history position holds a real interaction.
    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Time elapsed between the first history entry and each entry.
    pub fn time_since_first(&self) -> &Array2<f32> {
        &self.time_since_first
    }

    /// Time elapsed between each history entry and the scored event.
    pub fn time_to_now(&self) -> &Array2<f32> {
        &self.time_to_now
    }

    /// Labels, in input order.
    pub fn labels(&self) -> Vec<bool> {
        self.instances.iter().map(|x| x.label).collect()
    }

    /// Evaluation group of each instance: the user index.
    pub fn group_ids(&self) -> Vec<Index> {
        self.instances.iter().map(|x| x.user_id).collect()
    }
}

/// Builds [`Batch`](struct.Batch.html)es from mapped instances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchAssembler {
    negatives_per_positive: usize,
    max_history_length: Option<usize>,
}

impl BatchAssembler {
    /// Build an assembler for groups of one positive followed by
    /// `negatives_per_positive` negatives. Use 0 for ungrouped data.
    pub fn new(negatives_per_positive: usize) -> Self {
        BatchAssembler {
            negatives_per_positive,
            max_history_length: None,
        }
    }

    /// Keep only the most recent `max_history_length` history entries.
    pub fn max_history_length(mut self, max_history_length: usize) -> Self {
        self.max_history_length = Some(max_history_length);
        self
    }

    /// Instances per negative-sampling group.
    pub fn group_size(&self) -> usize {
        1 + self.negatives_per_positive
    }

    fn truncation_start(&self, instance: &MappedInstance) -> usize {
        match self.max_history_length {
            Some(max_length) => instance.history_len().saturating_sub(max_length),
            None => 0,
        }
    }

    /// Assemble a batch, preserving instance order.
    pub fn assemble(&self, instances: &[MappedInstance]) -> Result<Batch, DataError> {
        if instances.is_empty() {
            return Err(DataError::EmptyBatch);
        }

        for instance in instances {
            check_mapped(instance)?;
        }

        let width = instances
            .iter()
            .map(|x| x.history_len() - self.truncation_start(x))
            .max()
            .unwrap_or(0);
        let shape = (instances.len(), width);

        let mut history_item_ids = Array2::from_elem(shape, UNKNOWN_INDEX);
        let mut history_category_ids = Array2::from_elem(shape, UNKNOWN_INDEX);
        let mut mask = Array2::from_elem(shape, false);
        let mut time_since_first = Array2::zeros(shape);
        let mut time_to_now = Array2::zeros(shape);

        for (row, instance) in instances.iter().enumerate() {
            let start = self.truncation_start(instance);
            let length = instance.history_len() - start;
            let offset = width - length;

            let first_timestamp = instance.history_timestamps.get(start).cloned();

            for (position, &item_id, &category_id, &timestamp) in izip!(
                offset..width,
                &instance.history_item_ids[start..],
                &instance.history_category_ids[start..],
                &instance.history_timestamps[start..]
            ) {
                history_item_ids[(row, position)] = item_id;
                history_category_ids[(row, position)] = category_id;
                mask[(row, position)] = true;
                time_to_now[(row, position)] =
                    instance.timestamp.saturating_sub(timestamp).max(0) as f32;
                time_since_first[(row, position)] = first_timestamp
                    .map(|first| timestamp.saturating_sub(first).max(0) as f32)
                    .unwrap_or(0.0);
            }
        }

        Ok(Batch {
            item_ids: instances.iter().map(|x| x.item_id).collect(),
            category_ids: instances.iter().map(|x| x.category_id).collect(),
            instances: instances.to_owned(),
            history_item_ids,
            history_category_ids,
            mask,
            time_since_first,
            time_to_now,
        })
    }

    /// Validate that grouped input consists of whole groups, each
    /// a positive followed by negatives.
    pub fn check_groups(&self, instances: &[MappedInstance]) -> Result<(), DataError> {
        if self.negatives_per_positive == 0 {
            return Ok(());
        }

        for (group_idx, group) in instances.chunks(self.group_size()).enumerate() {
            let start = group_idx * self.group_size();

            if group.len() != self.group_size() {
                return Err(DataError::MalformedGroup { index: start });
            }

            if let Some(offset) = group
                .iter()
                .enumerate()
                .position(|(offset, x)| x.label != (offset == 0))
            {
                return Err(DataError::MalformedGroup {
                    index: start + offset,
                });
            }
        }

        Ok(())
    }

    /// Iterate over consecutive batches of roughly `batch_size`
    /// instances, in input order.
    ///
    /// The batch size is rounded up to a whole number of groups so
    /// no group straddles two batches. The last batch may be short.
    pub fn minibatches<'a>(
        &'a self,
        instances: &'a [MappedInstance],
        batch_size: usize,
    ) -> MinibatchIterator<'a> {
        let group_size = self.group_size();
        let minibatch_size = ((batch_size.max(1) + group_size - 1) / group_size) * group_size;

        MinibatchIterator {
            assembler: self,
            instances,
            idx: 0,
            minibatch_size,
        }
    }
}

/// Iterator over the batches of a slice of instances.
#[derive(Clone, Debug)]
pub struct MinibatchIterator<'a> {
    assembler: &'a BatchAssembler,
    instances: &'a [MappedInstance],
    idx: usize,
    minibatch_size: usize,
}

impl<'a> Iterator for MinibatchIterator<'a> {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.instances.len() {
            return None;
        }

        let start = self.idx;
        let stop = (self.idx + self.minibatch_size).min(self.instances.len());
        self.idx = stop;

        Some(self.assembler.assemble(&self.instances[start..stop]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::data::Instance;
    use crate::vocabulary::Vocabularies;

    fn scenario() -> Vec<Instance> {
        let mut instances: Vec<Instance> = vec!["1\tU1\tI9\tC1\t1000\tI1,I2\tC1,C1\t500,700"
            .parse()
            .unwrap()];

        for item in &["I3", "I4", "I5", "I6"] {
            instances.push(
                format!("0\tU1\t{}\tC1\t1000\tI1,I2\tC1,C1\t500,700", item)
                    .parse()
                    .unwrap(),
            );
        }

        instances
    }

    fn mapped(history: &[(Index, i64)], timestamp: i64) -> MappedInstance {
        MappedInstance {
            label: true,
            user_id: 1,
            item_id: 1,
            category_id: 1,
            timestamp,
            history_item_ids: history.iter().map(|x| x.0).collect(),
            history_category_ids: history.iter().map(|x| x.0 + 100).collect(),
            history_timestamps: history.iter().map(|x| x.1).collect(),
        }
    }

    #[test]
    fn negative_sampling_group() {
        let instances = scenario();
        let vocabularies = Vocabularies::build(&instances);
        let assembler = BatchAssembler::new(4);
        let mapped = vocabularies.map_all(&instances);

        assert!(assembler.check_groups(&mapped).is_ok());

        let batch = assembler.assemble(&mapped).unwrap();

        assert_eq!(batch.len(), 5);
        assert_eq!(batch.max_history_length(), 2);
        assert!(batch.mask().iter().all(|&x| x));
        assert_eq!(batch.labels(), vec![true, false, false, false, false]);

        let expected_items: Vec<Index> = ["I9", "I3", "I4", "I5", "I6"]
            .iter()
            .map(|x| vocabularies.items().lookup(x))
            .collect();
        assert_eq!(batch.item_ids(), &expected_items[..]);

        assert_eq!(batch.time_to_now()[(0, 0)], 500.0);
        assert_eq!(batch.time_to_now()[(0, 1)], 300.0);
        assert_eq!(batch.time_since_first()[(0, 0)], 0.0);
        assert_eq!(batch.time_since_first()[(0, 1)], 200.0);
    }

    #[test]
    fn empty_input_is_an_error() {
        let assembler = BatchAssembler::new(0);

        assert_eq!(assembler.assemble(&[]).unwrap_err(), DataError::EmptyBatch);
    }

    #[test]
    fn shorter_histories_are_left_padded() {
        let assembler = BatchAssembler::new(0);
        let instances = vec![
            mapped(&[(5, 10), (6, 20), (7, 30)], 40),
            mapped(&[(8, 25)], 40),
            mapped(&[], 40),
        ];

        let batch = assembler.assemble(&instances).unwrap();

        assert_eq!(batch.max_history_length(), 3);
        assert_eq!(batch.history_item_ids().row(1).to_vec(), vec![0, 0, 8]);
        assert_eq!(batch.mask().row(1).to_vec(), vec![false, false, true]);
        assert_eq!(batch.mask().row(2).to_vec(), vec![false, false, false]);
        assert_eq!(batch.time_to_now().row(1).to_vec(), vec![0.0, 0.0, 15.0]);
        assert_eq!(batch.time_since_first().row(0).to_vec(), vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn time_deltas_are_clamped() {
        let assembler = BatchAssembler::new(0);
        let instances = vec![mapped(&[(5, 50), (6, 30)], 40)];

        let batch = assembler.assemble(&instances).unwrap();

        assert_eq!(batch.time_to_now().row(0).to_vec(), vec![0.0, 10.0]);
        assert_eq!(batch.time_since_first().row(0).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn extreme_timestamps_saturate() {
        let assembler = BatchAssembler::new(0);
        let instances = vec![
            mapped(&[(5, -1)], i64::max_value()),
            mapped(&[(5, i64::min_value()), (6, i64::max_value())], i64::min_value()),
        ];

        let batch = assembler.assemble(&instances).unwrap();

        assert_eq!(batch.time_to_now()[(0, 1)], i64::max_value() as f32);
        assert_eq!(batch.time_since_first()[(1, 1)], i64::max_value() as f32);
        assert_eq!(batch.time_to_now().row(1).to_vec(), vec![0.0, 0.0]);
        assert!(batch.time_to_now().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn truncation_keeps_most_recent() {
        let assembler = BatchAssembler::new(0).max_history_length(2);
        let instances = vec![mapped(&[(5, 10), (6, 20), (7, 30)], 40)];

        let batch = assembler.assemble(&instances).unwrap();

        assert_eq!(batch.history_item_ids().row(0).to_vec(), vec![6, 7]);
        assert_eq!(batch.time_since_first().row(0).to_vec(), vec![0.0, 10.0]);
    }

    #[test]
    fn mismatched_mapped_history_is_malformed() {
        let assembler = BatchAssembler::new(0);
        let mut instance = mapped(&[(5, 10), (6, 20)], 40);
        instance.history_timestamps.pop();

        match assembler.assemble(&[instance]) {
            Err(DataError::MalformedRecord { .. }) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn minibatches_respect_groups() {
        let instances = scenario();
        let vocabularies = Vocabularies::build(&instances);
        let mut mapped = vocabularies.map_all(&instances);
        mapped.extend(mapped.clone());

        let assembler = BatchAssembler::new(4);
        let sizes: Vec<usize> = assembler
            .minibatches(&mapped, 3)
            .map(|batch| batch.unwrap().len())
            .collect();

        assert_eq!(sizes, vec![5, 5]);
    }

    #[test]
    fn malformed_groups() {
        let instances = scenario();
        let vocabularies = Vocabularies::build(&instances);
        let mapped = vocabularies.map_all(&instances);

        assert!(BatchAssembler::new(2).check_groups(&mapped[..3]).is_ok());
        assert_eq!(
            BatchAssembler::new(2).check_groups(&mapped[..4]).unwrap_err(),
            DataError::MalformedGroup { index: 3 }
        );
        assert_eq!(
            BatchAssembler::new(1).check_groups(&mapped[..4]).unwrap_err(),
            DataError::MalformedGroup { index: 2 }
        );
    }

    proptest! {
        #[test]
        fn prop_padding_is_masked_and_order_preserved(
            histories in proptest::collection::vec(
                proptest::collection::vec((1usize..1000, 0i64..1000), 0..8),
                1..16,
            )
        ) {
            let instances: Vec<MappedInstance> = histories
                .iter()
                .map(|history| mapped(history, 1000))
                .collect();

            let batch = BatchAssembler::new(0).assemble(&instances).unwrap();
            let width = batch.max_history_length();

            for (row, history) in histories.iter().enumerate() {
                let offset = width - history.len();

                for column in 0..width {
                    if !batch.mask()[(row, column)] {
                        prop_assert!(column < offset);
                        prop_assert_eq!(batch.history_item_ids()[(row, column)], UNKNOWN_INDEX);
                        prop_assert_eq!(batch.history_category_ids()[(row, column)], UNKNOWN_INDEX);
                    }
                }

                let kept: Vec<Index> = batch.history_item_ids().row(row).iter().skip(offset).cloned().collect();
                let original: Vec<Index> = history.iter().map(|x| x.0).collect();
                prop_assert_eq!(kept, original);
            }
        }
    }
}
