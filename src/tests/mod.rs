//! End-to-end scenarios driving the whole execution core: slots fed by an
//! upstream node, iteration step generation, typed reads with transparent
//! reloading, and the output cache.

use std::{
    collections::HashMap,
    sync::Arc,
};

use maplit::hashmap;

use crate::{
    annotation::{DataAnnotation, TextAnnotation},
    annotation::merge::{DataMergeMode, TextMergeMode},
    batch::generator::{ColumnMatching, GeneratorSettings, IterationStepGenerator},
    cache::{CacheEvent, CacheObserver, NodeId, OutputCache},
    data::{
        TextData, TypeTag,
        registry::{DataRuntime, TypeRegistry},
        spill::FsSpillBackend,
        store::DataItemStore,
    },
    progress::Progress,
    table::{DataTable, TableData, slot::{Slot, SlotInfo}},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fill_slot(
    runtime: &Arc<DataRuntime>,
    slot: &mut Slot,
    rows: &[(&str, &[(&str, &str)])],
    progress: &Progress,
) {
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
                progress,
            )
            .unwrap();
    }
}

/// One full hop: two upstream slots matched on a custom column, node logic
/// combining each step into an output row, results committed to the cache.
#[test]
fn test_pipeline_hop_with_cache() {
    init_tracing();
    let runtime = DataRuntime::in_memory();
    let progress = Progress::default();

    let mut images = Slot::new(SlotInfo::input("images", TypeTag::ANY));
    fill_slot(
        &runtime,
        &mut images,
        &[
            ("img-s1", &[("sample", "s1"), ("channel", "dapi")]),
            ("img-s2", &[("sample", "s2"), ("channel", "gfp")]),
        ],
        &progress,
    );
    let mut masks = Slot::new(SlotInfo::input("masks", TypeTag::ANY));
    fill_slot(
        &runtime,
        &mut masks,
        &[
            ("mask-s2", &[("sample", "s2")]),
            ("mask-s1", &[("sample", "s1")]),
        ],
        &progress,
    );

    let mut settings = GeneratorSettings::default();
    settings.column_matching = ColumnMatching::Custom;
    settings.custom_columns = vec!["sample".to_owned()];
    let mut generator = IterationStepGenerator::new(settings);
    generator.add_slot(&images).add_slot(&masks);
    let result = generator.generate(&progress).unwrap();
    result.ensure_complete().unwrap();
    assert_eq!(result.steps().len(), 2);

    // Node logic: combine the step's rows into one output row.
    let mut output = Slot::new(SlotInfo::output("segmented", TypeTag::ANY));
    for step in result.steps() {
        let image_row = step.single_input_row("images").unwrap();
        let mask_row = step.single_input_row("masks").unwrap();
        let image = images.table().data_as::<TextData>(image_row, &progress).unwrap();
        let mask = masks.table().data_as::<TextData>(mask_row, &progress).unwrap();
        output
            .table_mut()
            .add_value(
                &runtime,
                Box::new(TextData::new(format!("{}+{}", image.as_str(), mask.as_str()))),
                step.merged_text_annotations().values().cloned().collect(),
                TextMergeMode::Merge,
                &progress,
            )
            .unwrap();
    }

    // Steps come out in natural key order: s1 before s2.
    assert_eq!(
        output.table().data_as::<TextData>(0, &progress).unwrap().as_str(),
        "img-s1+mask-s1"
    );
    let merged: HashMap<String, String> = output
        .table()
        .text_annotations(0)
        .into_iter()
        .map(|a| (a.name().to_owned(), a.value().to_owned()))
        .collect();
    assert_eq!(
        merged,
        hashmap! {
            "sample".to_owned() => "s1".to_owned(),
            "channel".to_owned() => "dapi".to_owned(),
        }
    );

    let cache = OutputCache::new();
    let node = NodeId::new("segmentation");
    cache.store(node.clone(), "segmented", Arc::new(output.into_table()));
    let cached = cache.query(&node, &progress);
    assert_eq!(cached["segmented"].row_count(), 2);
    cache.invalidate(&node);
    assert!(cache.query(&node, &progress).is_empty());
}

/// Inputs spilled to backing storage are reloaded transparently during the
/// hop, and their summaries stay readable while virtualized.
#[test]
fn test_virtualized_inputs_are_reloaded_on_demand() {
    init_tracing();
    let runtime = DataRuntime::in_memory();
    let progress = Progress::default();

    let mut input = Slot::new(SlotInfo::input("in", TypeTag::ANY));
    fill_slot(
        &runtime,
        &mut input,
        &[
            ("alpha", &[("k", "1")]),
            ("beta", &[("k", "2")]),
        ],
        &progress,
    );
    input.table().virtualize_all(&progress).unwrap();
    assert!(input.table().store(0).unwrap().is_virtualized());
    assert_eq!(input.table().store(0).unwrap().string_representation(), "alpha");

    let mut generator = IterationStepGenerator::new(GeneratorSettings::default());
    generator.add_slot(&input);
    let result = generator.generate(&progress).unwrap();
    assert_eq!(result.steps().len(), 2);

    let mut values = Vec::new();
    for step in result.steps() {
        let row = step.single_input_row("in").unwrap();
        values.push(
            input
                .table()
                .data_as::<TextData>(row, &progress)
                .unwrap()
                .as_str()
                .to_owned(),
        );
    }
    values.sort();
    assert_eq!(values, vec!["alpha", "beta"]);
}

/// The filesystem spill backend round-trips values through actual files.
#[test]
fn test_filesystem_spill_round_trip() {
    init_tracing();
    let root = std::env::temp_dir().join(format!("rowflow-spill-{}", std::process::id()));
    let runtime = DataRuntime::new(
        TypeRegistry::new(),
        Box::new(FsSpillBackend::new(&root).unwrap()),
    );
    let progress = Progress::default();

    let store = DataItemStore::shared(runtime, Box::new(TextData::new("on disk")));
    store.virtualize(&progress).unwrap();
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 1);

    let value = store.get(&progress).unwrap();
    assert_eq!(
        value.as_any().downcast_ref::<TextData>().unwrap().as_str(),
        "on disk"
    );
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}

/// Duplicate data annotations on matched rows are packed into an aggregate
/// table under `MergeTables`, and nothing is lost.
#[test]
fn test_data_annotations_merge_into_aggregate_table() {
    init_tracing();
    let runtime = DataRuntime::in_memory();
    let progress = Progress::default();

    let mut slot = Slot::new(SlotInfo::input("in", TypeTag::ANY));
    for value in ["first", "second"] {
        let roi = DataAnnotation::new(
            "roi",
            DataItemStore::shared(runtime.clone(), Box::new(TextData::new(format!("roi of {value}")))),
        );
        slot.table_mut()
            .add_data(
                DataItemStore::shared(runtime.clone(), Box::new(TextData::new(value))),
                vec![TextAnnotation::new("k", "1")],
                TextMergeMode::Merge,
                vec![roi],
                DataMergeMode::MergeTables,
                &progress,
            )
            .unwrap();
    }

    let mut settings = GeneratorSettings::default();
    settings.column_matching = ColumnMatching::Union;
    settings.data_merge = DataMergeMode::MergeTables;
    let mut generator = IterationStepGenerator::new(settings);
    generator.add_slot(&slot);
    let result = generator.generate(&progress).unwrap();
    assert_eq!(result.steps().len(), 1);

    let step = &result.steps()[0];
    let merged = step.merged_data_annotations().get("roi").unwrap();
    let value = merged.store().get(&progress).unwrap();
    let aggregate = value.as_any().downcast_ref::<TableData>().unwrap();
    assert_eq!(aggregate.table().row_count(), 2);
    let first = aggregate.table().data_as::<TextData>(0, &progress).unwrap();
    assert_eq!(first.as_str(), "roi of first");
}

/// A duplicated table can be mutated without affecting the cached original.
#[test]
fn test_copy_on_use_discipline_against_the_cache() {
    init_tracing();
    let runtime = DataRuntime::in_memory();
    let progress = Progress::default();

    let mut table = DataTable::new(TypeTag::ANY);
    table
        .add_value(
            &runtime,
            Box::new(TextData::new("pristine")),
            vec![TextAnnotation::new("state", "committed")],
            TextMergeMode::Merge,
            &progress,
        )
        .unwrap();
    let cache = OutputCache::new();
    let node = NodeId::new("upstream");
    cache.store(node.clone(), "out", Arc::new(table));

    let cached = cache.query(&node, &progress);
    let mut working = cached["out"].duplicate(&progress).unwrap();
    working.add_text_annotation_to_all(TextAnnotation::new("state", "scratch"), true);
    working.clear();

    let untouched = cache.query(&node, &progress);
    assert_eq!(untouched["out"].row_count(), 1);
    assert_eq!(untouched["out"].text_annotation_or(0, "state", ""), "committed");
}

/// Gathering several upstream slots into one carries every row with its own
/// annotations.
#[test]
fn test_slot_to_slot_import() {
    init_tracing();
    let runtime = DataRuntime::in_memory();
    let progress = Progress::default();

    let mut first = Slot::new(SlotInfo::output("first", TypeTag::ANY));
    fill_slot(&runtime, &mut first, &[("a", &[("origin", "first")])], &progress);
    let mut second = Slot::new(SlotInfo::output("second", TypeTag::ANY));
    fill_slot(&runtime, &mut second, &[("b", &[("origin", "second")])], &progress);

    let mut gathered = Slot::new(SlotInfo::input("gathered", TypeTag::ANY));
    gathered
        .add_data_from_slot(
            &first,
            TextMergeMode::OverwriteExisting,
            DataMergeMode::OverwriteExisting,
            &progress,
        )
        .unwrap();
    gathered
        .add_data_from_slot(
            &second,
            TextMergeMode::OverwriteExisting,
            DataMergeMode::OverwriteExisting,
            &progress,
        )
        .unwrap();

    assert_eq!(gathered.table().row_count(), 2);
    assert_eq!(gathered.table().text_annotation_or(0, "origin", ""), "first");
    assert_eq!(gathered.table().text_annotation_or(1, "origin", ""), "second");
}

struct CountingObserver(std::sync::Mutex<usize>);

impl CacheObserver for CountingObserver {
    fn cache_changed(&self, _event: &CacheEvent) {
        *self.0.lock().unwrap() += 1;
    }
}

/// Observers see modifications and drop out on their own once released.
#[test]
fn test_cache_observer_lifecycle() {
    init_tracing();
    let runtime = DataRuntime::in_memory();
    let progress = Progress::default();
    let cache = OutputCache::new();

    let observer = Arc::new(CountingObserver(std::sync::Mutex::new(0)));
    let weak = Arc::downgrade(&observer);
    cache.subscribe(weak);

    let mut table = DataTable::new(TypeTag::ANY);
    table
        .add_value(
            &runtime,
            Box::new(TextData::new("x")),
            Vec::new(),
            TextMergeMode::Merge,
            &progress,
        )
        .unwrap();
    cache.store(NodeId::new("n"), "out", Arc::new(table));
    assert_eq!(*observer.0.lock().unwrap(), 1);

    drop(observer);
    cache.clear();
    // No panic and no dangling notification target.
    assert!(cache.is_empty());
}
