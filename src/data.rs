//! Interaction log records: parsing, serialization, reading and splitting.
use std::fmt;
use std::hash::Hasher;
use std::path::Path;
use std::str::FromStr;

use csv;
use failure;
use siphasher::sip::SipHasher;

use crate::{DataError, Index, Timestamp};

const NUM_FIELDS: usize = 8;
const LIST_SEPARATOR: char = ',';

/// A single prior interaction in a user's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Raw item identifier.
    pub item_id: String,
    /// Raw category identifier.
    pub category_id: String,
    /// When the interaction happened.
    pub timestamp: Timestamp,
}

/// One labelled interaction event together with the user's history
/// leading up to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Whether the user interacted with the item.
    pub label: bool,
    /// Raw user identifier.
    pub user_id: String,
    /// Raw item identifier.
    pub item_id: String,
    /// Raw category identifier.
    pub category_id: String,
    /// When the event happened.
    pub timestamp: Timestamp,
    /// Prior interactions, oldest first.
    pub history: Vec<HistoryEntry>,
}

/// An instance whose identifiers have been replaced by dense indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedInstance {
    /// Whether the user interacted with the item.
    pub label: bool,
    /// User index.
    pub user_id: Index,
    /// Item index.
    pub item_id: Index,
    /// Category index.
    pub category_id: Index,
    /// When the event happened.
    pub timestamp: Timestamp,
    /// History item indices, oldest first.
    pub history_item_ids: Vec<Index>,
    /// History category indices, aligned with `history_item_ids`.
    pub history_category_ids: Vec<Index>,
    /// History timestamps, aligned with `history_item_ids`.
    pub history_timestamps: Vec<Timestamp>,
}

impl MappedInstance {
    /// Number of history entries.
    pub fn history_len(&self) -> usize {
        self.history_item_ids.len()
    }
}

fn malformed<T: Into<String>>(reason: T) -> DataError {
    DataError::MalformedRecord {
        line: 0,
        reason: reason.into(),
    }
}

fn split_list(field: &str) -> Vec<&str> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split(LIST_SEPARATOR).collect()
    }
}

fn parse_timestamp(value: &str) -> Result<Timestamp, DataError> {
    value
        .trim()
        .parse::<Timestamp>()
        .map_err(|_| malformed(format!("invalid timestamp {:?}", value)))
}

impl Instance {
    /// Build an instance from the eight fields of a log record.
    pub fn from_fields(fields: &[&str]) -> Result<Self, DataError> {
        if fields.len() != NUM_FIELDS {
            return Err(malformed(format!(
                "expected {} fields, found {}",
                NUM_FIELDS,
                fields.len()
            )));
        }

        let label = match fields[0].trim() {
            "1" => true,
            "0" => false,
            other => return Err(malformed(format!("invalid label {:?}", other))),
        };
        let timestamp = parse_timestamp(fields[4])?;

        let item_ids = split_list(fields[5]);
        let category_ids = split_list(fields[6]);
        let timestamps = split_list(fields[7]);

        if item_ids.len() != category_ids.len() || item_ids.len() != timestamps.len() {
            return Err(malformed(format!(
                "history lists have different lengths ({} items, {} categories, {} timestamps)",
                item_ids.len(),
                category_ids.len(),
                timestamps.len()
            )));
        }

        let history = izip!(item_ids, category_ids, timestamps)
            .map(|(item_id, category_id, timestamp)| -> Result<HistoryEntry, DataError> {
                Ok(HistoryEntry {
                    item_id: item_id.to_owned(),
                    category_id: category_id.to_owned(),
                    timestamp: parse_timestamp(timestamp)?,
                })
            })
            .collect::<Result<Vec<_>, DataError>>()?;

        Ok(Instance {
            label,
            user_id: fields[1].to_owned(),
            item_id: fields[2].to_owned(),
            category_id: fields[3].to_owned(),
            timestamp,
            history,
        })
    }
}

impl FromStr for Instance {
    type Err = DataError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        let fields: Vec<&str> = line.split('\t').collect();

        Instance::from_fields(&fields)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let join = |values: Vec<String>| values.join(",");

        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            if self.label { 1 } else { 0 },
            self.user_id,
            self.item_id,
            self.category_id,
            self.timestamp,
            join(self.history.iter().map(|x| x.item_id.clone()).collect()),
            join(self.history.iter().map(|x| x.category_id.clone()).collect()),
            join(self.history.iter().map(|x| x.timestamp.to_string()).collect()),
        )
    }
}

/// Read every instance from a tab-delimited log file.
///
/// Processing stops at the first malformed record, whose 1-based line
/// number is reported.
pub fn read_instances<P: AsRef<Path>>(path: P) -> Result<Vec<Instance>, failure::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_path(path)?;

    let mut instances = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let line = record
            .position()
            .map(|position| position.line() as usize)
            .unwrap_or(idx + 1);
        let fields: Vec<&str> = record.iter().collect();

        let instance = Instance::from_fields(&fields).map_err(|error| match error {
            DataError::MalformedRecord { reason, .. } => DataError::MalformedRecord {
                line,
                reason,
            },
            other => other,
        })?;

        instances.push(instance);
    }

    tracing::debug!("Read {} instances", instances.len());

    Ok(instances)
}

/// Split instances into train and test sets so that all instances
/// of a given user end up on the same side.
///
/// Relative order within each side follows the input order.
pub fn user_based_split(
    instances: &[Instance],
    test_fraction: f32,
    seed: (u64, u64),
) -> (Vec<Instance>, Vec<Instance>) {
    let denominator = 100_000;
    let test_cutoff = (test_fraction * denominator as f32) as u64;

    let is_test = |x: &Instance| {
        let mut hasher = SipHasher::new_with_keys(seed.0, seed.1);
        hasher.write(x.user_id.as_bytes());
        hasher.finish() % denominator < test_cutoff
    };

    let (test, train): (Vec<Instance>, Vec<Instance>) =
        instances.iter().cloned().partition(|x| is_test(x));

    (train, test)
}
