//! Merge policies for duplicate same-named annotations
//!
//! Two entry points exist on purpose and behave subtly differently:
//! [`TextMergeMode::merge`] collapses a freshly gathered collection into at
//! most one annotation per name, while [`TextMergeMode::merge_into`] accretes
//! into an existing map where an empty prior value counts as absent. Node
//! logic depends on the exact behavior of each, so they are kept separate.

use std::sync::Arc;

use indexmap::{IndexMap, map::Entry};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    annotation::{DataAnnotation, TextAnnotation, decode_array_value, encode_array_value},
    data::{TypeTag, TypedValue, store::DataItemStore},
    progress::Progress,
    table::{DataTable, TableData},
};

/// Strategy for resolving several text annotations that share one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextMergeMode {
    /// Keep the first value seen per name.
    SkipExisting,
    /// Keep the last value seen per name.
    OverwriteExisting,
    /// Accrete values into a JSON array, deduplicated by exact equality.
    #[default]
    Merge,
    /// Like `Merge`, but an incoming value that is itself an array is
    /// spliced element-wise instead of being appended as one opaque value.
    MergeLists,
    /// Drop everything.
    Discard,
}

impl TextMergeMode {
    /// Collapse a collection of annotations into at most one entry per name,
    /// in first-seen name order.
    pub fn merge(
        &self,
        annotations: impl IntoIterator<Item = TextAnnotation>,
    ) -> Vec<TextAnnotation> {
        let mut merged: IndexMap<String, TextAnnotation> = IndexMap::new();
        match self {
            TextMergeMode::Discard => return Vec::new(),
            TextMergeMode::SkipExisting => {
                for annotation in annotations {
                    merged.entry(annotation.name().to_owned()).or_insert(annotation);
                }
            }
            TextMergeMode::OverwriteExisting => {
                for annotation in annotations {
                    merged.insert(annotation.name().to_owned(), annotation);
                }
            }
            TextMergeMode::Merge | TextMergeMode::MergeLists => {
                for annotation in annotations {
                    match merged.entry(annotation.name().to_owned()) {
                        Entry::Occupied(mut entry) => {
                            let value = self.merge_values(entry.get().value(), annotation.value());
                            *entry.get_mut() = TextAnnotation::new(annotation.name(), value);
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(annotation);
                        }
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Accrete annotations into an existing map. Unlike [`Self::merge`], an
    /// already-present entry with an empty value is treated as no prior
    /// value, and `Discard` clears the target key entirely.
    pub fn merge_into(
        &self,
        target: &mut IndexMap<String, TextAnnotation>,
        annotations: impl IntoIterator<Item = TextAnnotation>,
    ) {
        for annotation in annotations {
            let name = annotation.name().to_owned();
            match self {
                TextMergeMode::Discard => {
                    target.shift_remove(&name);
                }
                TextMergeMode::OverwriteExisting => {
                    target.insert(name, annotation);
                }
                TextMergeMode::SkipExisting => {
                    let absent = target.get(&name).is_none_or(|a| a.value().is_empty());
                    if absent {
                        target.insert(name, annotation);
                    }
                }
                TextMergeMode::Merge | TextMergeMode::MergeLists => {
                    let existing = target
                        .get(&name)
                        .map(|a| a.value().to_owned())
                        .unwrap_or_default();
                    let value = self.merge_values(&existing, annotation.value());
                    target.insert(name, TextAnnotation::new(annotation.name(), value));
                }
            }
        }
    }

    /// Resolve one existing value against one incoming value. An empty
    /// existing value counts as absent. For `Discard` the result is empty.
    pub fn merge_values(&self, existing: &str, incoming: &str) -> String {
        match self {
            TextMergeMode::SkipExisting => {
                if existing.is_empty() {
                    incoming.to_owned()
                } else {
                    existing.to_owned()
                }
            }
            TextMergeMode::OverwriteExisting => incoming.to_owned(),
            TextMergeMode::Discard => String::new(),
            TextMergeMode::Merge | TextMergeMode::MergeLists => {
                if existing.is_empty() {
                    return incoming.to_owned();
                }
                let mut values = decode_array_value(existing);
                let incoming_values = if matches!(self, TextMergeMode::MergeLists) {
                    decode_array_value(incoming)
                } else {
                    vec![incoming.to_owned()]
                };
                for value in incoming_values {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
                encode_array_value(values)
            }
        }
    }
}

/// Strategy for resolving several data annotations that share one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataMergeMode {
    /// Keep the first item seen per name.
    SkipExisting,
    /// Keep the last item seen per name.
    OverwriteExisting,
    /// Pack same-named duplicates into an aggregate table, one row per
    /// duplicate, so no item is lost.
    Merge,
    /// Like `Merge`, but a duplicate that is itself a table contributes its
    /// rows to the aggregate instead of nesting a table inside a table.
    #[default]
    MergeTables,
    /// Drop everything.
    Discard,
}

impl DataMergeMode {
    /// Collapse a collection of data annotations into at most one entry per
    /// name, in first-seen name order.
    pub fn merge(
        &self,
        annotations: Vec<DataAnnotation>,
        progress: &Progress,
    ) -> Result<Vec<DataAnnotation>, Error> {
        match self {
            DataMergeMode::Discard => Ok(Vec::new()),
            DataMergeMode::SkipExisting => {
                let mut merged: IndexMap<String, DataAnnotation> = IndexMap::new();
                for annotation in annotations {
                    merged.entry(annotation.name().to_owned()).or_insert(annotation);
                }
                Ok(merged.into_values().collect())
            }
            DataMergeMode::OverwriteExisting => {
                let mut merged: IndexMap<String, DataAnnotation> = IndexMap::new();
                for annotation in annotations {
                    merged.insert(annotation.name().to_owned(), annotation);
                }
                Ok(merged.into_values().collect())
            }
            DataMergeMode::Merge | DataMergeMode::MergeTables => {
                let mut groups: IndexMap<String, Vec<DataAnnotation>> = IndexMap::new();
                for annotation in annotations {
                    groups
                        .entry(annotation.name().to_owned())
                        .or_default()
                        .push(annotation);
                }
                let mut merged = Vec::with_capacity(groups.len());
                for (name, group) in groups {
                    if group.len() == 1 {
                        merged.extend(group);
                        continue;
                    }
                    merged.push(self.pack(name, group, progress)?);
                }
                Ok(merged)
            }
        }
    }

    /// Accrete data annotations into an existing map, merging duplicates
    /// against whatever is already present under the same name.
    pub fn merge_into(
        &self,
        target: &mut IndexMap<String, DataAnnotation>,
        annotations: Vec<DataAnnotation>,
        progress: &Progress,
    ) -> Result<(), Error> {
        for annotation in annotations {
            let name = annotation.name().to_owned();
            match self {
                DataMergeMode::Discard => {
                    target.shift_remove(&name);
                }
                DataMergeMode::OverwriteExisting => {
                    target.insert(name, annotation);
                }
                DataMergeMode::SkipExisting => {
                    target.entry(name).or_insert(annotation);
                }
                DataMergeMode::Merge | DataMergeMode::MergeTables => {
                    match target.get(&name).cloned() {
                        Some(existing) => {
                            let packed = self.pack(name.clone(), vec![existing, annotation], progress)?;
                            target.insert(name, packed);
                        }
                        None => {
                            target.insert(name, annotation);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pack duplicates into one annotation referencing an aggregate table.
    fn pack(
        &self,
        name: String,
        group: Vec<DataAnnotation>,
        progress: &Progress,
    ) -> Result<DataAnnotation, Error> {
        let runtime = group[0].store().runtime().clone();
        let mut aggregate = DataTable::new(TypeTag::ANY);
        for annotation in group {
            progress.check_cancelled()?;
            if matches!(self, DataMergeMode::MergeTables)
                && annotation.store().type_tag() == TableData::TAG
            {
                let value = annotation.store().get(progress)?;
                if let Some(nested) = value.as_any().downcast_ref::<TableData>() {
                    aggregate.add_data_from_table(
                        nested.table(),
                        TextMergeMode::OverwriteExisting,
                        DataMergeMode::OverwriteExisting,
                        progress,
                    )?;
                    continue;
                }
            }
            aggregate.add_data(
                annotation.store().clone(),
                Vec::new(),
                TextMergeMode::OverwriteExisting,
                Vec::new(),
                DataMergeMode::OverwriteExisting,
                progress,
            )?;
        }
        let store = DataItemStore::new(runtime, Box::new(TableData::new(aggregate)));
        Ok(DataAnnotation::new(name, Arc::new(store)))
    }
}
