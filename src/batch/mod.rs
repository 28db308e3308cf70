//! Iteration steps
//!
//! An iteration step is one logical unit of work for a node: per input slot,
//! the indices of the rows that belong together under the active grouping
//! key, plus the annotations of all contributing rows merged once at
//! construction time. Steps reference rows in their originating tables and
//! never copy data; materialization happens when a consumer reads.

pub mod generator;
pub mod limit;

use std::{cmp::Ordering, fmt};

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    Error,
    annotation::{DataAnnotation, TextAnnotation, natural_cmp},
};

/// Grouping key of one step: the values of the matching columns in column
/// order, with `None` for rows lacking the annotation. Ordered naturally so
/// step order is reproducible regardless of upstream row order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey(Vec<Option<String>>);

impl StepKey {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.0
    }
}

impl PartialOrd for StepKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StepKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (left, right) in self.0.iter().zip(other.0.iter()) {
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(left), Some(right)) => natural_cmp(left, right),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|value| value.as_deref().unwrap_or("<none>"))
            .join(", ");
        f.write_str(&rendered)
    }
}

#[derive(Debug)]
pub struct IterationStep {
    key: StepKey,
    inputs: IndexMap<String, Vec<usize>>,
    merged_text: IndexMap<String, TextAnnotation>,
    merged_data: IndexMap<String, DataAnnotation>,
    incomplete: bool,
}

impl IterationStep {
    pub(crate) fn new(key: StepKey) -> Self {
        Self {
            key,
            inputs: IndexMap::new(),
            merged_text: IndexMap::new(),
            merged_data: IndexMap::new(),
            incomplete: false,
        }
    }

    pub(crate) fn add_input(&mut self, slot: &str, rows: Vec<usize>) {
        self.inputs.entry(slot.to_owned()).or_default().extend(rows);
    }

    pub(crate) fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    pub(crate) fn merged_text_mut(&mut self) -> &mut IndexMap<String, TextAnnotation> {
        &mut self.merged_text
    }

    pub(crate) fn merged_data_mut(&mut self) -> &mut IndexMap<String, DataAnnotation> {
        &mut self.merged_data
    }

    pub fn key(&self) -> &StepKey {
        &self.key
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    /// Row indices this step draws from the given slot, in ascending order.
    pub fn input_rows(&self, slot: &str) -> &[usize] {
        self.inputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single contributing row, for slots where the matching strategy
    /// guarantees at most one.
    pub fn single_input_row(&self, slot: &str) -> Option<usize> {
        match self.input_rows(slot) {
            [row] => Some(*row),
            _ => None,
        }
    }

    /// True iff a required slot contributed no row for this step's key.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.values().all(Vec::is_empty)
    }

    pub fn merged_text_annotations(&self) -> &IndexMap<String, TextAnnotation> {
        &self.merged_text
    }

    pub fn merged_text_annotation_or(&self, name: &str, default: &str) -> String {
        self.merged_text
            .get(name)
            .map(|a| a.value().to_owned())
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn merged_data_annotations(&self) -> &IndexMap<String, DataAnnotation> {
        &self.merged_data
    }
}

impl fmt::Display for IterationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: usize = self.inputs.values().map(Vec::len).sum();
        write!(f, "step [{}] ({rows} rows", self.key)?;
        if self.incomplete {
            f.write_str(", incomplete")?;
        }
        f.write_str(")")
    }
}

/// Output of one generator run: the steps in their final order plus the
/// reference columns that were matched on.
#[derive(Debug)]
pub struct GenerationResult {
    steps: Vec<IterationStep>,
    reference_columns: Vec<String>,
}

impl GenerationResult {
    pub(crate) fn new(steps: Vec<IterationStep>, reference_columns: Vec<String>) -> Self {
        Self {
            steps,
            reference_columns,
        }
    }

    pub fn steps(&self) -> &[IterationStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<IterationStep> {
        self.steps
    }

    pub fn reference_columns(&self) -> &[String] {
        &self.reference_columns
    }

    /// Abort policy for incomplete steps: error out on the first one instead
    /// of processing with gaps or skipping silently.
    pub fn ensure_complete(&self) -> Result<(), Error> {
        match self.steps.iter().find(|step| step.is_incomplete()) {
            Some(step) => Err(Error::IncompleteStep {
                key: step.key().to_string(),
            }),
            None => Ok(()),
        }
    }
}
