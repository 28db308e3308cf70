use crate::data::TypeTag;

pub mod annotation;
pub mod batch;
pub mod cache;
pub mod data;
pub mod progress;
pub mod table;

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("type mismatch: slot accepts '{accepted}' but received '{actual}' and no converter is registered")]
    TypeMismatch { accepted: TypeTag, actual: TypeTag },
    #[error("no conversion path from '{from}' to '{to}'")]
    ConversionUnavailable { from: TypeTag, to: TypeTag },
    #[error("backing storage unavailable for '{key}': {source}")]
    StorageUnavailable {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode data item: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode spilled data item: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("unknown data type tag '{0}'")]
    UnknownType(String),
    #[error("row {row} is out of bounds for a table with {count} rows")]
    RowOutOfBounds { row: usize, count: usize },
    #[error("invalid index limit '{input}': {reason}")]
    InvalidLimit { input: String, reason: String },
    #[error("incomplete iteration step for key [{key}]")]
    IncompleteStep { key: String },
    #[error("operation was cancelled")]
    Cancelled,
}
