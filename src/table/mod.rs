//! Data tables
//!
//! A data table is the ordered, row-indexed container behind every slot:
//! each row pairs one stored data item with its text and data annotations.
//! Row order is insertion order and is semantically significant. Tables are
//! schema-on-read; the annotation columns are the accumulated union of names
//! seen across all rows.

pub mod slot;

use std::{any::Any, sync::Arc};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    annotation::{DataAnnotation, TextAnnotation},
    annotation::merge::{DataMergeMode, TextMergeMode},
    data::{DataValue, TypeTag, TypedValue, registry::DataRuntime, store::DataItemStore},
    progress::Progress,
};

#[derive(Debug)]
struct TableRow {
    store: Arc<DataItemStore>,
    text_annotations: IndexMap<String, TextAnnotation>,
    data_annotations: IndexMap<String, DataAnnotation>,
}

#[derive(Debug)]
pub struct DataTable {
    accepted: TypeTag,
    rows: Vec<TableRow>,
    text_columns: IndexSet<String>,
    data_columns: IndexSet<String>,
}

impl DataTable {
    pub fn new(accepted: TypeTag) -> Self {
        Self {
            accepted,
            rows: Vec::new(),
            text_columns: IndexSet::new(),
            data_columns: IndexSet::new(),
        }
    }

    pub fn accepted_type(&self) -> TypeTag {
        self.accepted
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append one row. The supplied annotation lists are first collapsed to
    /// one entry per name under the given merge modes; the store must hold a
    /// value that is the accepted type or convertible to it.
    pub fn add_data(
        &mut self,
        store: Arc<DataItemStore>,
        text_annotations: Vec<TextAnnotation>,
        text_mode: TextMergeMode,
        data_annotations: Vec<DataAnnotation>,
        data_mode: DataMergeMode,
        progress: &Progress,
    ) -> Result<usize, Error> {
        if !store.runtime().types().accepts(store.type_tag(), self.accepted) {
            return Err(Error::TypeMismatch {
                accepted: self.accepted,
                actual: store.type_tag(),
            });
        }
        let text_annotations = if text_annotations.is_empty() {
            text_annotations
        } else {
            text_mode.merge(text_annotations)
        };
        let data_annotations = if data_annotations.is_empty() {
            data_annotations
        } else {
            data_mode.merge(data_annotations, progress)?
        };

        let mut row = TableRow {
            store,
            text_annotations: IndexMap::new(),
            data_annotations: IndexMap::new(),
        };
        for annotation in text_annotations {
            self.text_columns.insert(annotation.name().to_owned());
            row.text_annotations.insert(annotation.name().to_owned(), annotation);
        }
        for annotation in data_annotations {
            self.data_columns.insert(annotation.name().to_owned());
            row.data_annotations.insert(annotation.name().to_owned(), annotation);
        }
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    /// Append a freshly produced value, wrapping it into a store.
    pub fn add_value(
        &mut self,
        runtime: &Arc<DataRuntime>,
        value: Box<dyn DataValue>,
        text_annotations: Vec<TextAnnotation>,
        text_mode: TextMergeMode,
        progress: &Progress,
    ) -> Result<usize, Error> {
        self.add_data(
            Arc::new(DataItemStore::new(runtime.clone(), value)),
            text_annotations,
            text_mode,
            Vec::new(),
            DataMergeMode::OverwriteExisting,
            progress,
        )
    }

    /// Import every row of another table, sharing its stores and carrying
    /// each row's own annotations through the given merge modes.
    pub fn add_data_from_table(
        &mut self,
        other: &DataTable,
        text_mode: TextMergeMode,
        data_mode: DataMergeMode,
        progress: &Progress,
    ) -> Result<(), Error> {
        for row in 0..other.row_count() {
            let row_progress = progress.resolve_indexed("import row", row, other.row_count());
            self.add_data(
                other.store(row)?.clone(),
                other.text_annotations(row),
                text_mode,
                other.data_annotations(row),
                data_mode,
                &row_progress,
            )?;
        }
        Ok(())
    }

    /// Deep copy: every store and every data annotation is duplicated, so
    /// mutating the copy can never affect other holders of the source rows.
    pub fn duplicate(&self, progress: &Progress) -> Result<DataTable, Error> {
        let mut copy = DataTable::new(self.accepted);
        for (index, row) in self.rows.iter().enumerate() {
            let row_progress = progress.resolve_indexed("duplicate row", index, self.rows.len());
            let store = Arc::new(row.store.duplicate(&row_progress)?);
            let mut data_annotations = Vec::with_capacity(row.data_annotations.len());
            for annotation in row.data_annotations.values() {
                data_annotations.push(annotation.duplicate(&row_progress)?);
            }
            copy.add_data(
                store,
                row.text_annotations.values().cloned().collect(),
                TextMergeMode::OverwriteExisting,
                data_annotations,
                DataMergeMode::OverwriteExisting,
                &row_progress,
            )?;
        }
        Ok(copy)
    }

    pub fn store(&self, row: usize) -> Result<&Arc<DataItemStore>, Error> {
        self.rows
            .get(row)
            .map(|r| &r.store)
            .ok_or(Error::RowOutOfBounds {
                row,
                count: self.rows.len(),
            })
    }

    /// The row's value, materialized and converted to the requested type.
    pub fn data(
        &self,
        row: usize,
        as_type: TypeTag,
        progress: &Progress,
    ) -> Result<Arc<dyn DataValue>, Error> {
        self.store(row)?.get_as(as_type, progress)
    }

    /// Typed access for values with a statically known tag.
    pub fn data_as<T: TypedValue>(
        &self,
        row: usize,
        progress: &Progress,
    ) -> Result<Arc<T>, Error> {
        let value = self.data(row, T::TAG, progress)?;
        let from = value.type_tag();
        value
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| Error::ConversionUnavailable { from, to: T::TAG })
    }

    pub fn text_annotation(&self, row: usize, name: &str) -> Option<&TextAnnotation> {
        self.rows.get(row)?.text_annotations.get(name)
    }

    /// Annotations are optional per row, so absence yields the default
    /// instead of an error.
    pub fn text_annotation_or(&self, row: usize, name: &str, default: &str) -> String {
        self.text_annotation(row, name)
            .map(|a| a.value().to_owned())
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn text_annotations(&self, row: usize) -> Vec<TextAnnotation> {
        self.rows
            .get(row)
            .map(|r| r.text_annotations.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn text_annotations_for_rows(&self, rows: &[usize]) -> Vec<TextAnnotation> {
        rows.iter().flat_map(|&row| self.text_annotations(row)).collect()
    }

    pub fn data_annotation(&self, row: usize, name: &str) -> Option<&DataAnnotation> {
        self.rows.get(row)?.data_annotations.get(name)
    }

    pub fn data_annotations(&self, row: usize) -> Vec<DataAnnotation> {
        self.rows
            .get(row)
            .map(|r| r.data_annotations.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn data_annotations_for_rows(&self, rows: &[usize]) -> Vec<DataAnnotation> {
        rows.iter().flat_map(|&row| self.data_annotations(row)).collect()
    }

    /// Accumulated union of text annotation names across all rows.
    pub fn text_annotation_columns(&self) -> impl Iterator<Item = &str> {
        self.text_columns.iter().map(String::as_str)
    }

    /// Accumulated union of data annotation names across all rows.
    pub fn data_annotation_columns(&self) -> impl Iterator<Item = &str> {
        self.data_columns.iter().map(String::as_str)
    }

    /// Indices of all rows annotated with the given name/value pair.
    pub fn find_rows(&self, name: &str, value: &str) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.text_annotations
                    .get(name)
                    .is_some_and(|a| a.value() == value)
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Attach an annotation to every existing row. With `overwrite` false,
    /// rows that already carry the name keep their value.
    pub fn add_text_annotation_to_all(&mut self, annotation: TextAnnotation, overwrite: bool) {
        self.text_columns.insert(annotation.name().to_owned());
        for row in &mut self.rows {
            if !overwrite && row.text_annotations.contains_key(annotation.name()) {
                continue;
            }
            row.text_annotations
                .insert(annotation.name().to_owned(), annotation.clone());
        }
    }

    /// Drop one annotation column from every row.
    pub fn remove_text_annotation_column(&mut self, name: &str) {
        self.text_columns.shift_remove(name);
        for row in &mut self.rows {
            row.text_annotations.shift_remove(name);
        }
    }

    /// Spill every row's value (and data annotation values) to backing
    /// storage.
    pub fn virtualize_all(&self, progress: &Progress) -> Result<(), Error> {
        for (index, row) in self.rows.iter().enumerate() {
            let row_progress = progress.resolve_indexed("virtualize row", index, self.rows.len());
            row.store.virtualize(&row_progress)?;
            for annotation in row.data_annotations.values() {
                annotation.store().virtualize(&row_progress)?;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.text_columns.clear();
        self.data_columns.clear();
    }
}

/// A data table wrapped as a data value, so aggregates of merged data
/// annotations can themselves live in a store and be spilled like any other
/// item.
#[derive(Debug)]
pub struct TableData(DataTable);

impl TableData {
    pub fn new(table: DataTable) -> Self {
        Self(table)
    }

    pub fn table(&self) -> &DataTable {
        &self.0
    }

    pub fn into_table(self) -> DataTable {
        self.0
    }
}

impl TypedValue for TableData {
    const TAG: TypeTag = TypeTag::new("table");
}

#[derive(Serialize, Deserialize)]
struct TableEnvelope {
    accepted: String,
    rows: Vec<RowEnvelope>,
}

#[derive(Serialize, Deserialize)]
struct RowEnvelope {
    tag: String,
    bytes: Vec<u8>,
    text: Vec<TextAnnotation>,
    data: Vec<DataAnnotationEnvelope>,
}

#[derive(Serialize, Deserialize)]
struct DataAnnotationEnvelope {
    name: String,
    tag: String,
    bytes: Vec<u8>,
}

impl DataValue for TableData {
    fn type_tag(&self) -> TypeTag {
        Self::TAG
    }

    fn string_summary(&self) -> String {
        format!("data table with {} rows", self.0.row_count())
    }

    fn clone_value(&self, progress: &Progress) -> Result<Box<dyn DataValue>, Error> {
        Ok(Box::new(TableData(self.0.duplicate(progress)?)))
    }

    fn encode(&self, progress: &Progress) -> Result<Vec<u8>, Error> {
        let mut rows = Vec::with_capacity(self.0.row_count());
        for row in 0..self.0.row_count() {
            progress.check_cancelled()?;
            let value = self.0.store(row)?.get(progress)?;
            let mut data = Vec::new();
            for annotation in self.0.data_annotations(row) {
                let nested = annotation.store().get(progress)?;
                data.push(DataAnnotationEnvelope {
                    name: annotation.name().to_owned(),
                    tag: nested.type_tag().name().to_owned(),
                    bytes: nested.encode(progress)?,
                });
            }
            rows.push(RowEnvelope {
                tag: value.type_tag().name().to_owned(),
                bytes: value.encode(progress)?,
                text: self.0.text_annotations(row),
                data,
            });
        }
        let envelope = TableEnvelope {
            accepted: self.0.accepted_type().name().to_owned(),
            rows,
        };
        Ok(bincode::serde::encode_to_vec(&envelope, bincode::config::standard())?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) fn decode_table(
    runtime: &Arc<DataRuntime>,
    bytes: &[u8],
    progress: &Progress,
) -> Result<Box<dyn DataValue>, Error> {
    let (envelope, _) = bincode::serde::decode_from_slice::<TableEnvelope, _>(
        bytes,
        bincode::config::standard(),
    )?;
    let accepted = runtime
        .types()
        .resolve(&envelope.accepted)
        .ok_or_else(|| Error::UnknownType(envelope.accepted.clone()))?;
    let mut table = DataTable::new(accepted);
    for row in envelope.rows {
        progress.check_cancelled()?;
        let tag = runtime
            .types()
            .resolve(&row.tag)
            .ok_or_else(|| Error::UnknownType(row.tag.clone()))?;
        let value = runtime.types().decode(runtime, tag, &row.bytes, progress)?;
        let mut data_annotations = Vec::with_capacity(row.data.len());
        for annotation in row.data {
            let tag = runtime
                .types()
                .resolve(&annotation.tag)
                .ok_or_else(|| Error::UnknownType(annotation.tag.clone()))?;
            let value = runtime
                .types()
                .decode(runtime, tag, &annotation.bytes, progress)?;
            data_annotations.push(DataAnnotation::new(
                annotation.name,
                Arc::new(DataItemStore::new(runtime.clone(), value)),
            ));
        }
        table.add_data(
            Arc::new(DataItemStore::new(runtime.clone(), value)),
            row.text,
            TextMergeMode::OverwriteExisting,
            data_annotations,
            DataMergeMode::OverwriteExisting,
            progress,
        )?;
    }
    Ok(Box::new(TableData(table)))
}
