//! Type and conversion registry
//!
//! Replaces the process-global datatype registry of comparable systems with
//! an explicitly constructed value that is injected into the stores through
//! [`DataRuntime`]. Conversion between registered types follows the shortest
//! path over the registered converter edges.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    Error,
    data::{DataValue, TextData, TypeTag, TypedValue, decode_text},
    progress::Progress,
    table::{TableData, decode_table},
};

use super::spill::{MemorySpillBackend, SpillBackend};

/// Reconstructs a value of one registered type from its spilled bytes.
pub type DecodeFn =
    Arc<dyn Fn(&Arc<DataRuntime>, &[u8], &Progress) -> Result<Box<dyn DataValue>, Error> + Send + Sync>;

/// Converts a value of one registered type into another.
pub type ConvertFn =
    Arc<dyn Fn(&dyn DataValue, &Progress) -> Result<Box<dyn DataValue>, Error> + Send + Sync>;

pub struct TypeRegistry {
    decoders: IndexMap<TypeTag, DecodeFn>,
    converters: IndexMap<(TypeTag, TypeTag), ConvertFn>,
}

impl TypeRegistry {
    /// Registry with the built-in value types (`text`, `table`) present.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_decoder(TextData::TAG, Arc::new(|_, bytes, _| decode_text(bytes)));
        registry.register_decoder(
            TableData::TAG,
            Arc::new(|runtime, bytes, progress| decode_table(runtime, bytes, progress)),
        );
        registry
    }

    pub fn empty() -> Self {
        Self {
            decoders: IndexMap::new(),
            converters: IndexMap::new(),
        }
    }

    pub fn register_decoder(&mut self, tag: TypeTag, decode: DecodeFn) {
        self.decoders.insert(tag, decode);
    }

    pub fn register_converter(&mut self, from: TypeTag, to: TypeTag, convert: ConvertFn) {
        self.converters.insert((from, to), convert);
    }

    /// Resolve a tag by name, as read back from spilled metadata.
    pub fn resolve(&self, name: &str) -> Option<TypeTag> {
        if name == TypeTag::ANY.name() {
            return Some(TypeTag::ANY);
        }
        self.decoders.keys().copied().find(|tag| tag.name() == name)
    }

    /// Whether a value of `from` may live in a slot bounded by `accepted`.
    pub fn accepts(&self, from: TypeTag, accepted: TypeTag) -> bool {
        accepted == TypeTag::ANY || from == accepted || self.conversion_path(from, accepted).is_some()
    }

    /// Shortest chain of registered converters from `from` to `to`, as the
    /// sequence of visited tags.
    pub fn conversion_path(&self, from: TypeTag, to: TypeTag) -> Option<Vec<TypeTag>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut visited = IndexSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from);
        queue.push_back(vec![from]);
        while let Some(path) = queue.pop_front() {
            let last = *path.last().expect("paths are never empty");
            for (edge_from, edge_to) in self.converters.keys() {
                if *edge_from != last || !visited.insert(*edge_to) {
                    continue;
                }
                let mut next = path.clone();
                next.push(*edge_to);
                if *edge_to == to {
                    return Some(next);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Convert a value to the requested tag, chaining registered converters
    /// as needed. Identity and conversion to the unconstrained bound are
    /// free.
    pub fn convert(
        &self,
        value: Arc<dyn DataValue>,
        to: TypeTag,
        progress: &Progress,
    ) -> Result<Arc<dyn DataValue>, Error> {
        let from = value.type_tag();
        if from == to || to == TypeTag::ANY {
            return Ok(value);
        }
        let path = self
            .conversion_path(from, to)
            .ok_or(Error::ConversionUnavailable { from, to })?;
        let mut current = value;
        for pair in path.windows(2) {
            progress.check_cancelled()?;
            let step = self
                .converters
                .get(&(pair[0], pair[1]))
                .expect("path edges come from the converter table");
            current = Arc::from(step(current.as_ref(), progress)?);
        }
        Ok(current)
    }

    pub(crate) fn decode(
        &self,
        runtime: &Arc<DataRuntime>,
        tag: TypeTag,
        bytes: &[u8],
        progress: &Progress,
    ) -> Result<Box<dyn DataValue>, Error> {
        let decode = self
            .decoders
            .get(&tag)
            .ok_or_else(|| Error::UnknownType(tag.name().to_owned()))?;
        decode(runtime, bytes, progress)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("converters", &self.converters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared handle combining the type registry with the spill backend. Every
/// [`super::store::DataItemStore`] holds one, so virtualization and typed
/// access need no global state.
pub struct DataRuntime {
    types: TypeRegistry,
    spill: Box<dyn SpillBackend>,
    next_spill_id: AtomicU64,
}

impl DataRuntime {
    pub fn new(types: TypeRegistry, spill: Box<dyn SpillBackend>) -> Arc<Self> {
        Arc::new(Self {
            types,
            spill,
            next_spill_id: AtomicU64::new(0),
        })
    }

    /// Runtime with built-in types and an in-memory spill area.
    pub fn in_memory() -> Arc<Self> {
        Self::new(TypeRegistry::new(), Box::new(MemorySpillBackend::new()))
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub(crate) fn spill(&self) -> &dyn SpillBackend {
        self.spill.as_ref()
    }

    pub(crate) fn next_spill_key(&self) -> String {
        format!("item-{}", self.next_spill_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for DataRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRuntime")
            .field("types", &self.types)
            .field("spill", &self.spill)
            .finish()
    }
}
