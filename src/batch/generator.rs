//! Iteration step generation
//!
//! Partitions the rows of a set of input slots into iteration steps so that
//! rows sharing the configured reference annotation columns land in the same
//! step. Grouped modes emit steps in natural key order, which makes
//! generation reproducible across runs even when upstream row order is not.

use std::collections::BTreeMap;

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    annotation::{TextAnnotation, natural_cmp},
    annotation::merge::{DataMergeMode, TextMergeMode},
    batch::{GenerationResult, IterationStep, StepKey, limit::IndexLimit},
    progress::Progress,
    table::slot::Slot,
};

/// How the reference columns for matching are determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnMatching {
    /// Match on the union of annotation columns across all input slots.
    #[default]
    Union,
    /// Match on the columns present in every input slot.
    Intersection,
    /// Match on an explicit column list from the node configuration.
    Custom,
    /// One step holding every row of every slot.
    MergeAll,
    /// One step per row of every slot.
    SplitAll,
    /// No grouping: each row of the primary (first) slot becomes its own
    /// step, and every other slot contributes the rows that agree with it on
    /// all annotations the two rows share.
    PerRow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GeneratorSettings {
    pub column_matching: ColumnMatching,
    pub custom_columns: Vec<String>,
    pub text_merge: TextMergeMode,
    pub data_merge: DataMergeMode,
    /// Restricts the result to a subset of step indices. Applied after
    /// grouping and sorting, never before, so indices are stable.
    pub limit: Option<IndexLimit>,
    /// Silently drop steps missing a required slot. Without it they pass
    /// through flagged and the caller decides.
    pub skip_incomplete: bool,
}

pub struct IterationStepGenerator<'a> {
    slots: Vec<&'a Slot>,
    settings: GeneratorSettings,
}

impl<'a> IterationStepGenerator<'a> {
    pub fn new(settings: GeneratorSettings) -> Self {
        Self {
            slots: Vec::new(),
            settings,
        }
    }

    pub fn add_slot(&mut self, slot: &'a Slot) -> &mut Self {
        self.slots.push(slot);
        self
    }

    pub fn slots(&self) -> &[&'a Slot] {
        &self.slots
    }

    /// The columns rows are matched on, in natural order. Empty for the
    /// strategies that do not group by columns.
    pub fn reference_columns(&self) -> Vec<String> {
        match self.settings.column_matching {
            ColumnMatching::Union => {
                let mut union = IndexSet::new();
                for slot in &self.slots {
                    union.extend(slot.table().text_annotation_columns().map(str::to_owned));
                }
                union
                    .into_iter()
                    .sorted_by(|a, b| natural_cmp(a, b))
                    .collect()
            }
            ColumnMatching::Intersection => {
                let mut slots = self.slots.iter();
                let mut intersection: IndexSet<String> = match slots.next() {
                    Some(slot) => slot
                        .table()
                        .text_annotation_columns()
                        .map(str::to_owned)
                        .collect(),
                    None => return Vec::new(),
                };
                for slot in slots {
                    let columns: IndexSet<String> = slot
                        .table()
                        .text_annotation_columns()
                        .map(str::to_owned)
                        .collect();
                    intersection.retain(|column| columns.contains(column));
                }
                intersection
                    .into_iter()
                    .sorted_by(|a, b| natural_cmp(a, b))
                    .collect()
            }
            ColumnMatching::Custom => self
                .settings
                .custom_columns
                .iter()
                .cloned()
                .collect::<IndexSet<_>>()
                .into_iter()
                .sorted_by(|a, b| natural_cmp(a, b))
                .collect(),
            ColumnMatching::MergeAll | ColumnMatching::SplitAll | ColumnMatching::PerRow => {
                Vec::new()
            }
        }
    }

    pub fn generate(&self, progress: &Progress) -> Result<GenerationResult, Error> {
        let progress = progress.resolve("iteration steps");
        let columns = self.reference_columns();
        let mut steps = match self.settings.column_matching {
            ColumnMatching::MergeAll => self.merge_all(&progress)?,
            ColumnMatching::SplitAll => self.split_all(&progress)?,
            ColumnMatching::PerRow => self.per_row(&progress)?,
            ColumnMatching::Union | ColumnMatching::Intersection | ColumnMatching::Custom => {
                self.grouped(&columns, &progress)?
            }
        };

        if let Some(limit) = &self.settings.limit {
            progress.log(format!("applying limit {limit} to {} steps", steps.len()));
            let mut index = 0usize;
            steps.retain(|_| {
                let keep = limit.contains(index);
                index += 1;
                keep
            });
        }
        for step in &steps {
            if step.is_incomplete() {
                progress.log(format!("incomplete {step}"));
            }
        }
        if self.settings.skip_incomplete {
            let before = steps.len();
            steps.retain(|step| !step.is_incomplete());
            if steps.len() != before {
                progress.log(format!("skipped {} incomplete steps", before - steps.len()));
            }
        }
        Ok(GenerationResult::new(steps, columns))
    }

    fn grouped(
        &self,
        columns: &[String],
        progress: &Progress,
    ) -> Result<Vec<IterationStep>, Error> {
        let mut buckets: BTreeMap<StepKey, IndexMap<String, Vec<usize>>> = BTreeMap::new();
        for slot in &self.slots {
            let slot_progress = progress.resolve(slot.name());
            slot_progress.log("grouping rows");
            let table = slot.table();
            for row in 0..table.row_count() {
                slot_progress.check_cancelled()?;
                let key = StepKey::new(
                    columns
                        .iter()
                        .map(|column| {
                            table
                                .text_annotation(row, column)
                                .map(|a| a.value().to_owned())
                        })
                        .collect(),
                );
                buckets
                    .entry(key)
                    .or_default()
                    .entry(slot.name().to_owned())
                    .or_default()
                    .push(row);
            }
        }

        let mut steps = Vec::with_capacity(buckets.len());
        for (key, by_slot) in buckets {
            progress.check_cancelled()?;
            let mut step = IterationStep::new(key);
            for slot in &self.slots {
                let rows = by_slot.get(slot.name()).cloned().unwrap_or_default();
                self.merge_step_annotations(&mut step, slot, &rows, progress)?;
                step.add_input(slot.name(), rows);
            }
            self.flag_missing_required(&mut step);
            steps.push(step);
        }
        Ok(steps)
    }

    fn per_row(&self, progress: &Progress) -> Result<Vec<IterationStep>, Error> {
        let Some((primary, secondary)) = self.slots.split_first() else {
            return Ok(Vec::new());
        };
        let mut steps = Vec::with_capacity(primary.table().row_count());
        for row in 0..primary.table().row_count() {
            progress.check_cancelled()?;
            let reference = primary.table().text_annotations(row);
            let key = StepKey::new(
                reference
                    .iter()
                    .sorted_by(|a, b| natural_cmp(a.name(), b.name()))
                    .map(|annotation| Some(annotation.to_string()))
                    .collect(),
            );
            let mut step = IterationStep::new(key);
            self.merge_step_annotations(&mut step, primary, &[row], progress)?;
            step.add_input(primary.name(), vec![row]);
            for slot in secondary {
                let table = slot.table();
                let matched: Vec<usize> = (0..table.row_count())
                    .filter(|&candidate| {
                        annotations_agree(&reference, &table.text_annotations(candidate))
                    })
                    .collect();
                self.merge_step_annotations(&mut step, slot, &matched, progress)?;
                step.add_input(slot.name(), matched);
            }
            self.flag_missing_required(&mut step);
            steps.push(step);
        }
        Ok(steps)
    }

    fn merge_all(&self, progress: &Progress) -> Result<Vec<IterationStep>, Error> {
        let mut step = IterationStep::new(StepKey::new(Vec::new()));
        for slot in &self.slots {
            progress.check_cancelled()?;
            let rows: Vec<usize> = (0..slot.table().row_count()).collect();
            self.merge_step_annotations(&mut step, slot, &rows, progress)?;
            step.add_input(slot.name(), rows);
        }
        self.flag_missing_required(&mut step);
        Ok(vec![step])
    }

    fn split_all(&self, progress: &Progress) -> Result<Vec<IterationStep>, Error> {
        let mut steps = Vec::new();
        for slot in &self.slots {
            for row in 0..slot.table().row_count() {
                progress.check_cancelled()?;
                let mut step = IterationStep::new(StepKey::new(vec![Some(format!(
                    "{}/{row}",
                    slot.name()
                ))]));
                for other in &self.slots {
                    step.add_input(other.name(), Vec::new());
                }
                self.merge_step_annotations(&mut step, slot, &[row], progress)?;
                step.add_input(slot.name(), vec![row]);
                self.flag_missing_required(&mut step);
                steps.push(step);
            }
        }
        Ok(steps)
    }

    fn merge_step_annotations(
        &self,
        step: &mut IterationStep,
        slot: &Slot,
        rows: &[usize],
        progress: &Progress,
    ) -> Result<(), Error> {
        let table = slot.table();
        self.settings
            .text_merge
            .merge_into(step.merged_text_mut(), table.text_annotations_for_rows(rows));
        self.settings.data_merge.merge_into(
            step.merged_data_mut(),
            table.data_annotations_for_rows(rows),
            progress,
        )?;
        Ok(())
    }

    fn flag_missing_required(&self, step: &mut IterationStep) {
        for slot in &self.slots {
            if step.input_rows(slot.name()).is_empty() && !slot.is_optional() {
                step.mark_incomplete();
                return;
            }
        }
    }
}

/// Equality over the annotations both rows share. A candidate lacking an
/// annotation of the reference row still agrees; a differing value does not.
fn annotations_agree(reference: &[TextAnnotation], candidate: &[TextAnnotation]) -> bool {
    reference.iter().all(|annotation| {
        candidate
            .iter()
            .find(|other| other.name() == annotation.name())
            .is_none_or(|other| other.value() == annotation.value())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        data::{TextData, TypeTag, registry::DataRuntime},
        table::slot::SlotInfo,
    };

    use super::*;

    fn slot(runtime: &Arc<DataRuntime>, name: &str, rows: &[(&str, &[(&str, &str)])]) -> Slot {
        let mut slot = Slot::new(SlotInfo::input(name, TypeTag::ANY));
        let progress = Progress::null();
        for (value, annotations) in rows {
            slot.table_mut()
                .add_value(
                    runtime,
                    Box::new(TextData::new(*value)),
                    annotations
                        .iter()
                        .map(|(name, value)| TextAnnotation::new(*name, *value))
                        .collect(),
                    TextMergeMode::Merge,
                    &progress,
                )
                .unwrap();
        }
        slot
    }

    fn settings(matching: ColumnMatching) -> GeneratorSettings {
        GeneratorSettings {
            column_matching: matching,
            ..Default::default()
        }
    }

    #[test]
    fn test_union_matching_groups_by_shared_column() {
        let runtime = DataRuntime::in_memory();
        let raw = slot(
            &runtime,
            "raw",
            &[
                ("a1", &[("group", "A")]),
                ("a2", &[("group", "A")]),
                ("b1", &[("group", "B")]),
            ],
        );
        let masks = slot(
            &runtime,
            "masks",
            &[
                ("ma1", &[("group", "A")]),
                ("ma2", &[("group", "A")]),
                ("mb1", &[("group", "B")]),
            ],
        );
        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::Union));
        generator.add_slot(&raw).add_slot(&masks);
        let result = generator.generate(&Progress::null()).unwrap();

        assert_eq!(result.reference_columns(), &["group".to_owned()]);
        assert_eq!(result.steps().len(), 2);
        let a = &result.steps()[0];
        assert_eq!(a.input_rows("raw"), &[0, 1]);
        assert_eq!(a.input_rows("masks"), &[0, 1]);
        assert!(!a.is_incomplete());
        let b = &result.steps()[1];
        assert_eq!(b.input_rows("raw"), &[2]);
        assert_eq!(b.input_rows("masks"), &[2]);
        assert!(!b.is_incomplete());
        assert!(result.ensure_complete().is_ok());
    }

    #[test]
    fn test_missing_required_slot_flags_incomplete_without_dropping() {
        let runtime = DataRuntime::in_memory();
        let a = slot(&runtime, "a", &[("x", &[("k", "1")]), ("y", &[("k", "2")])]);
        let b = slot(&runtime, "b", &[("x", &[("k", "1")]), ("y", &[("k", "2")])]);
        let c = slot(&runtime, "c", &[("x", &[("k", "1")])]);
        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::Union));
        generator.add_slot(&a).add_slot(&b).add_slot(&c);
        let result = generator.generate(&Progress::null()).unwrap();

        assert_eq!(result.steps().len(), 2);
        let incomplete: Vec<_> = result
            .steps()
            .iter()
            .filter(|step| step.is_incomplete())
            .collect();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].key().values(), &[Some("2".to_owned())]);
        assert!(matches!(
            result.ensure_complete(),
            Err(Error::IncompleteStep { .. })
        ));
    }

    #[test]
    fn test_optional_slot_does_not_flag_incomplete() {
        let runtime = DataRuntime::in_memory();
        let required = slot(&runtime, "required", &[("x", &[("k", "1")])]);
        let mut optional = Slot::new(SlotInfo::input("extra", TypeTag::ANY).optional());
        optional
            .table_mut()
            .add_value(
                &runtime,
                Box::new(TextData::new("unrelated")),
                vec![TextAnnotation::new("k", "9")],
                TextMergeMode::Merge,
                &Progress::null(),
            )
            .unwrap();
        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::Union));
        generator.add_slot(&required).add_slot(&optional);
        let result = generator.generate(&Progress::null()).unwrap();

        let step = result
            .steps()
            .iter()
            .find(|step| !step.input_rows("required").is_empty())
            .unwrap();
        assert!(step.input_rows("extra").is_empty());
        assert!(!step.is_incomplete());
        // The group contributed only by the optional slot lacks the required
        // slot and is flagged.
        let orphan = result
            .steps()
            .iter()
            .find(|step| step.input_rows("required").is_empty())
            .unwrap();
        assert!(orphan.is_incomplete());
    }

    #[test]
    fn test_generation_is_deterministic_across_row_orders() {
        let runtime = DataRuntime::in_memory();
        let forward = slot(
            &runtime,
            "in",
            &[
                ("r1", &[("sample", "s2")]),
                ("r2", &[("sample", "s10")]),
                ("r3", &[("sample", "s1")]),
            ],
        );
        let backward = slot(
            &runtime,
            "in",
            &[
                ("r3", &[("sample", "s1")]),
                ("r2", &[("sample", "s10")]),
                ("r1", &[("sample", "s2")]),
            ],
        );
        let keys = |slot: &Slot| {
            let mut generator = IterationStepGenerator::new(settings(ColumnMatching::Union));
            generator.add_slot(slot);
            generator
                .generate(&Progress::null())
                .unwrap()
                .into_steps()
                .into_iter()
                .map(|step| step.key().clone())
                .collect::<Vec<_>>()
        };
        let first = keys(&forward);
        let second = keys(&backward);
        assert_eq!(first, second);
        // Natural order: s1 before s2 before s10.
        let rendered: Vec<_> = first.iter().map(StepKey::to_string).collect();
        assert_eq!(rendered, vec!["s1", "s2", "s10"]);
    }

    #[test]
    fn test_limit_applies_after_sorting() {
        let runtime = DataRuntime::in_memory();
        let input = slot(
            &runtime,
            "in",
            &[
                ("d", &[("k", "4")]),
                ("b", &[("k", "2")]),
                ("a", &[("k", "1")]),
                ("c", &[("k", "3")]),
            ],
        );
        let mut config = settings(ColumnMatching::Union);
        config.limit = Some(IndexLimit::parse("1-2").unwrap());
        let mut generator = IterationStepGenerator::new(config);
        generator.add_slot(&input);
        let result = generator.generate(&Progress::null()).unwrap();
        let keys: Vec<_> = result.steps().iter().map(|s| s.key().to_string()).collect();
        assert_eq!(keys, vec!["2", "3"]);
    }

    #[test]
    fn test_skip_incomplete_drops_flagged_steps() {
        let runtime = DataRuntime::in_memory();
        let a = slot(&runtime, "a", &[("x", &[("k", "1")]), ("y", &[("k", "2")])]);
        let b = slot(&runtime, "b", &[("x", &[("k", "1")])]);
        let mut config = settings(ColumnMatching::Union);
        config.skip_incomplete = true;
        let mut generator = IterationStepGenerator::new(config);
        generator.add_slot(&a).add_slot(&b);
        let result = generator.generate(&Progress::null()).unwrap();
        assert_eq!(result.steps().len(), 1);
        assert!(result.ensure_complete().is_ok());
    }

    #[test]
    fn test_per_row_matches_on_shared_annotation_subset() {
        let runtime = DataRuntime::in_memory();
        let primary = slot(
            &runtime,
            "images",
            &[
                ("i1", &[("sample", "s1")]),
                ("i2", &[("sample", "s2")]),
            ],
        );
        let reference = slot(
            &runtime,
            "references",
            &[
                // Extra annotation: still agrees with i1 on the shared subset.
                ("r1", &[("sample", "s1"), ("channel", "dapi")]),
                ("r2", &[("sample", "s2")]),
                ("r3", &[("sample", "s2")]),
                // No shared annotations at all: attaches to every step.
                ("r4", &[]),
            ],
        );
        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::PerRow));
        generator.add_slot(&primary).add_slot(&reference);
        let result = generator.generate(&Progress::null()).unwrap();

        assert_eq!(result.steps().len(), 2);
        assert_eq!(result.steps()[0].input_rows("images"), &[0]);
        assert_eq!(result.steps()[0].input_rows("references"), &[0, 3]);
        assert_eq!(result.steps()[1].input_rows("images"), &[1]);
        assert_eq!(result.steps()[1].input_rows("references"), &[1, 2, 3]);
    }

    #[test]
    fn test_merge_all_and_split_all() {
        let runtime = DataRuntime::in_memory();
        let a = slot(&runtime, "a", &[("x", &[("k", "1")]), ("y", &[("k", "2")])]);
        let b = slot(&runtime, "b", &[("z", &[("k", "3")])]);

        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::MergeAll));
        generator.add_slot(&a).add_slot(&b);
        let merged = generator.generate(&Progress::null()).unwrap();
        assert_eq!(merged.steps().len(), 1);
        assert_eq!(merged.steps()[0].input_rows("a"), &[0, 1]);
        assert_eq!(merged.steps()[0].input_rows("b"), &[0]);

        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::SplitAll));
        generator.add_slot(&a).add_slot(&b);
        let split = generator.generate(&Progress::null()).unwrap();
        assert_eq!(split.steps().len(), 3);
        assert!(split.steps().iter().all(|step| {
            step.input_rows("a").len() + step.input_rows("b").len() == 1
        }));
    }

    #[test]
    fn test_custom_columns_ignore_other_annotations() {
        let runtime = DataRuntime::in_memory();
        let input = slot(
            &runtime,
            "in",
            &[
                ("x", &[("sample", "s1"), ("noise", "a")]),
                ("y", &[("sample", "s1"), ("noise", "b")]),
            ],
        );
        let mut config = settings(ColumnMatching::Custom);
        config.custom_columns = vec!["sample".to_owned()];
        let mut generator = IterationStepGenerator::new(config);
        generator.add_slot(&input);
        let result = generator.generate(&Progress::null()).unwrap();
        assert_eq!(result.steps().len(), 1);
        assert_eq!(result.steps()[0].input_rows("in"), &[0, 1]);
        // Differing values of the ignored column are merged into an array.
        assert_eq!(
            result.steps()[0].merged_text_annotation_or("noise", ""),
            r#"["a","b"]"#
        );
    }

    #[test]
    fn test_merged_annotations_follow_text_merge_mode() {
        let runtime = DataRuntime::in_memory();
        let input = slot(
            &runtime,
            "in",
            &[
                ("x", &[("k", "1"), ("who", "x")]),
                ("y", &[("k", "1"), ("who", "y")]),
            ],
        );
        let mut config = settings(ColumnMatching::Custom);
        config.custom_columns = vec!["k".to_owned()];
        config.text_merge = TextMergeMode::OverwriteExisting;
        let mut generator = IterationStepGenerator::new(config);
        generator.add_slot(&input);
        let result = generator.generate(&Progress::null()).unwrap();
        assert_eq!(
            result.steps()[0].merged_text_annotation_or("who", ""),
            "y"
        );
    }

    #[test]
    fn test_cancellation_stops_generation() {
        let runtime = DataRuntime::in_memory();
        let input = slot(&runtime, "in", &[("x", &[("k", "1")])]);
        let mut generator = IterationStepGenerator::new(settings(ColumnMatching::Union));
        generator.add_slot(&input);
        let progress = Progress::null();
        progress.cancel_flag().cancel();
        assert!(matches!(
            generator.generate(&progress),
            Err(Error::Cancelled)
        ));
    }
}
