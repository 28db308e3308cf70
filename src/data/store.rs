//! Data item store and virtualization
//!
//! A store owns exactly one logical value and is either Resident (value in
//! memory) or Virtualized (value spilled to backing storage, memory
//! released). Reloading happens transparently on access; only the reify
//! transition itself is serialized, so concurrent readers stay cheap.

use std::{
    fmt,
    sync::{Arc, Mutex, RwLock},
};

use tracing::trace;

use crate::{
    Error,
    data::{DataValue, TypeTag, registry::DataRuntime},
    progress::Progress,
};

enum StoreState {
    Resident(Arc<dyn DataValue>),
    Virtualized { key: String },
}

pub struct DataItemStore {
    runtime: Arc<DataRuntime>,
    type_tag: TypeTag,
    summary: Mutex<String>,
    state: RwLock<StoreState>,
}

impl DataItemStore {
    pub fn new(runtime: Arc<DataRuntime>, value: Box<dyn DataValue>) -> Self {
        Self {
            type_tag: value.type_tag(),
            summary: Mutex::new(value.string_summary()),
            state: RwLock::new(StoreState::Resident(Arc::from(value))),
            runtime,
        }
    }

    /// Convenience for the common case of sharing a fresh store between
    /// tables.
    pub fn shared(runtime: Arc<DataRuntime>, value: Box<dyn DataValue>) -> Arc<Self> {
        Arc::new(Self::new(runtime, value))
    }

    pub fn runtime(&self) -> &Arc<DataRuntime> {
        &self.runtime
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Human-readable summary. Never forces a reload; the summary is cached
    /// at creation and refreshed when the value is virtualized.
    pub fn string_representation(&self) -> String {
        self.summary.lock().unwrap().clone()
    }

    pub fn is_virtualized(&self) -> bool {
        matches!(*self.state.read().unwrap(), StoreState::Virtualized { .. })
    }

    /// The value, reloading it from backing storage first if needed.
    pub fn get(&self, progress: &Progress) -> Result<Arc<dyn DataValue>, Error> {
        {
            let state = self.state.read().unwrap();
            if let StoreState::Resident(value) = &*state {
                return Ok(value.clone());
            }
        }
        let mut state = self.state.write().unwrap();
        let key = match &*state {
            // Another reader won the race and already reified.
            StoreState::Resident(value) => return Ok(value.clone()),
            StoreState::Virtualized { key } => key.clone(),
        };
        progress.check_cancelled()?;
        progress.log(format!("reloading spilled item '{key}'"));
        let bytes = self
            .runtime
            .spill()
            .read(&key)
            .map_err(|source| Error::StorageUnavailable {
                key: key.clone(),
                source,
            })?;
        let value: Arc<dyn DataValue> = Arc::from(self.runtime.types().decode(
            &self.runtime,
            self.type_tag,
            &bytes,
            progress,
        )?);
        if let Err(error) = self.runtime.spill().remove(&key) {
            trace!(key, %error, "could not remove reloaded spill entry");
        }
        *state = StoreState::Resident(value.clone());
        Ok(value)
    }

    /// The value converted to the requested tag.
    pub fn get_as(&self, to: TypeTag, progress: &Progress) -> Result<Arc<dyn DataValue>, Error> {
        let value = self.get(progress)?;
        self.runtime.types().convert(value, to, progress)
    }

    /// Spill the value to backing storage and release the in-memory payload.
    /// Virtualizing an already virtualized store is a no-op.
    pub fn virtualize(&self, progress: &Progress) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        let value = match &*state {
            StoreState::Resident(value) => value.clone(),
            StoreState::Virtualized { .. } => return Ok(()),
        };
        progress.check_cancelled()?;
        let bytes = value.encode(progress)?;
        let key = self.runtime.next_spill_key();
        self.runtime
            .spill()
            .write(&key, &bytes)
            .map_err(|source| Error::StorageUnavailable {
                key: key.clone(),
                source,
            })?;
        *self.summary.lock().unwrap() = value.string_summary();
        progress.log(format!("virtualized item as '{key}'"));
        *state = StoreState::Virtualized { key };
        Ok(())
    }

    /// Independent Resident copy. The source keeps its current state: a
    /// virtualized source is decoded straight from its spilled bytes and
    /// never made resident by this call.
    pub fn duplicate(&self, progress: &Progress) -> Result<DataItemStore, Error> {
        let state = self.state.read().unwrap();
        let value = match &*state {
            StoreState::Resident(value) => value.clone_value(progress)?,
            StoreState::Virtualized { key } => {
                progress.check_cancelled()?;
                let bytes = self
                    .runtime
                    .spill()
                    .read(key)
                    .map_err(|source| Error::StorageUnavailable {
                        key: key.clone(),
                        source,
                    })?;
                self.runtime
                    .types()
                    .decode(&self.runtime, self.type_tag, &bytes, progress)?
            }
        };
        Ok(DataItemStore::new(self.runtime.clone(), value))
    }
}

impl Drop for DataItemStore {
    fn drop(&mut self) {
        let Ok(state) = self.state.read() else {
            return;
        };
        if let StoreState::Virtualized { key } = &*state {
            if let Err(error) = self.runtime.spill().remove(key) {
                trace!(key, %error, "could not remove spill entry of dropped store");
            }
        }
    }
}

impl fmt::Debug for DataItemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataItemStore")
            .field("type", &self.type_tag)
            .field("virtualized", &self.is_virtualized())
            .finish()
    }
}
