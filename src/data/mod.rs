//! Data values and their ownership plumbing
//!
//! A pipeline moves opaque, possibly heavy values between nodes. The core
//! does not know their concrete types; it works against the [`DataValue`]
//! trait and a [`registry::TypeRegistry`] of decoders and converters that is
//! constructed explicitly and injected, never global.

pub mod registry;
pub mod spill;
pub mod store;

use std::{any::Any, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{Error, progress::Progress};

/// Identifies a registered data type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(&'static str);

impl TypeTag {
    /// The unconstrained bound. Every value is accepted by a slot declared
    /// with this tag, and conversion to it is the identity.
    pub const ANY: TypeTag = TypeTag("any");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.0)
    }
}

/// One unit of data flowing through the pipeline.
///
/// Implementations must be deeply cloneable and encodable to bytes so the
/// store can spill them to backing storage and reload them on demand.
pub trait DataValue: Any + Send + Sync + fmt::Debug {
    fn type_tag(&self) -> TypeTag;

    /// Short human-readable summary, cached by the store so it stays
    /// available while the value itself is spilled.
    fn string_summary(&self) -> String;

    /// Independent deep copy. Takes the progress context because copying
    /// composite values may reload spilled members.
    fn clone_value(&self, progress: &Progress) -> Result<Box<dyn DataValue>, Error>;

    /// Encode for spilling. The matching decoder is registered in the
    /// [`registry::TypeRegistry`] under [`Self::type_tag`].
    fn encode(&self, progress: &Progress) -> Result<Vec<u8>, Error>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Data values whose tag is known statically, enabling typed accessors like
/// [`crate::table::DataTable::data_as`].
pub trait TypedValue: DataValue + Sized {
    const TAG: TypeTag;
}

/// Built-in plain text value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextData(pub String);

impl TextData {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TypedValue for TextData {
    const TAG: TypeTag = TypeTag::new("text");
}

impl DataValue for TextData {
    fn type_tag(&self) -> TypeTag {
        Self::TAG
    }

    fn string_summary(&self) -> String {
        self.0.clone()
    }

    fn clone_value(&self, _progress: &Progress) -> Result<Box<dyn DataValue>, Error> {
        Ok(Box::new(self.clone()))
    }

    fn encode(&self, _progress: &Progress) -> Result<Vec<u8>, Error> {
        Ok(bincode::serde::encode_to_vec(&self.0, bincode::config::standard())?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) fn decode_text(bytes: &[u8]) -> Result<Box<dyn DataValue>, Error> {
    let (text, _) =
        bincode::serde::decode_from_slice::<String, _>(bytes, bincode::config::standard())?;
    Ok(Box::new(TextData(text)))
}
