//! Mapping raw identifiers to dense indices.
//!
//! Identifiers missing from a vocabulary map to [`UNKNOWN_INDEX`](../constant.UNKNOWN_INDEX.html)
//! instead of failing. This is deliberate: models are served on entities
//! they never saw during training, and all of those share the single
//! reserved embedding row. Mapping is therefore not injective.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use failure;
use serde_json;

use crate::data::{Instance, MappedInstance};
use crate::{DataError, Index, UNKNOWN_INDEX};

/// An immutable mapping from raw identifiers to dense indices.
///
/// Index 0 is reserved for unknown identifiers; known identifiers
/// occupy `1..len()`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vocabulary {
    index: HashMap<String, Index>,
}

impl Vocabulary {
    /// Build a vocabulary from identifier occurrences.
    ///
    /// More frequent identifiers get smaller indices; ties are broken
    /// lexicographically so the result does not depend on input order.
    pub fn build<'a, I: IntoIterator<Item = &'a str>>(identifiers: I) -> Self {
        let mut counts: HashMap<&'a str, usize> = HashMap::new();

        for identifier in identifiers {
            *counts.entry(identifier).or_insert(0) += 1;
        }

        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let index = counts
            .into_iter()
            .enumerate()
            .map(|(idx, (identifier, _))| (identifier.to_owned(), idx + 1))
            .collect();

        Vocabulary { index }
    }

    /// Return the index of `identifier`, or the unknown index if it is absent.
    pub fn lookup(&self, identifier: &str) -> Index {
        self.index
            .get(identifier)
            .cloned()
            .unwrap_or(UNKNOWN_INDEX)
    }

    /// Whether the identifier is known.
    pub fn contains(&self, identifier: &str) -> bool {
        self.index.contains_key(identifier)
    }

    /// Number of embedding rows needed to cover this vocabulary,
    /// including the reserved unknown row.
    pub fn len(&self) -> usize {
        self.index.values().max().map(|x| x + 1).unwrap_or(1)
    }

    /// Whether the vocabulary has no known identifiers.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Write the vocabulary as a JSON object.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), failure::Error> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;

        Ok(())
    }

    /// Read a vocabulary written by [`save`](#method.save) or by an
    /// external preprocessing step.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let reader = BufReader::new(File::open(path)?);
        let vocabulary: Vocabulary = serde_json::from_reader(reader)?;

        if let Some((identifier, _)) = vocabulary
            .index
            .iter()
            .find(|&(_, &idx)| idx == UNKNOWN_INDEX)
        {
            bail!(
                "Identifier {:?} uses the reserved unknown index {}.",
                identifier,
                UNKNOWN_INDEX
            );
        }

        Ok(vocabulary)
    }
}

/// The user, item and category vocabularies used to map instances.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vocabularies {
    users: Vocabulary,
    items: Vocabulary,
    categories: Vocabulary,
}

impl Vocabularies {
    /// Assemble from existing vocabularies.
    pub fn new(users: Vocabulary, items: Vocabulary, categories: Vocabulary) -> Self {
        Vocabularies {
            users,
            items,
            categories,
        }
    }

    /// Build all three vocabularies from training instances. Item and
    /// category vocabularies also cover identifiers seen in histories.
    pub fn build(instances: &[Instance]) -> Self {
        let users = Vocabulary::build(instances.iter().map(|x| x.user_id.as_str()));
        let items = Vocabulary::build(instances.iter().flat_map(|x| {
            Some(x.item_id.as_str())
                .into_iter()
                .chain(x.history.iter().map(|entry| entry.item_id.as_str()))
        }));
        let categories = Vocabulary::build(instances.iter().flat_map(|x| {
            Some(x.category_id.as_str())
                .into_iter()
                .chain(x.history.iter().map(|entry| entry.category_id.as_str()))
        }));

        tracing::info!(
            "Built vocabularies: {} users, {} items, {} categories",
            users.len(),
            items.len(),
            categories.len()
        );

        Vocabularies::new(users, items, categories)
    }

    /// User vocabulary.
    pub fn users(&self) -> &Vocabulary {
        &self.users
    }

    /// Item vocabulary.
    pub fn items(&self) -> &Vocabulary {
        &self.items
    }

    /// Category vocabulary.
    pub fn categories(&self) -> &Vocabulary {
        &self.categories
    }

    /// Replace every identifier of `instance` with its index.
    pub fn map(&self, instance: &Instance) -> MappedInstance {
        MappedInstance {
            label: instance.label,
            user_id: self.users.lookup(&instance.user_id),
            item_id: self.items.lookup(&instance.item_id),
            category_id: self.categories.lookup(&instance.category_id),
            timestamp: instance.timestamp,
            history_item_ids: instance
                .history
                .iter()
                .map(|x| self.items.lookup(&x.item_id))
                .collect(),
            history_category_ids: instance
                .history
                .iter()
                .map(|x| self.categories.lookup(&x.category_id))
                .collect(),
            history_timestamps: instance.history.iter().map(|x| x.timestamp).collect(),
        }
    }

    /// Map a slice of instances, preserving order.
    pub fn map_all(&self, instances: &[Instance]) -> Vec<MappedInstance> {
        instances.iter().map(|x| self.map(x)).collect()
    }
}

/// Ensure a mapped instance has consistent history lists.
pub fn check_mapped(instance: &MappedInstance) -> Result<(), DataError> {
    let len = instance.history_item_ids.len();

    if instance.history_category_ids.len() != len || instance.history_timestamps.len() != len {
        return Err(DataError::MalformedRecord {
            line: 0,
            reason: "mapped history lists have different lengths".to_owned(),
        });
    }

    Ok(())
}
