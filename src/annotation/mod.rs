//! Row annotations
//!
//! Every row in a data table carries a set of named text annotations and
//! named data annotations. Text annotation values may encode a JSON string
//! array when several values were merged under one name; the codec here is
//! deliberately forgiving and treats anything that fails to parse as an
//! opaque scalar.

pub mod merge;

use std::{cmp::Ordering, fmt, iter::Peekable, str::Chars, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{Error, data::store::DataItemStore, progress::Progress};

/// Digit-aware string comparison, so that `"image2"` sorts before
/// `"image10"`. Runs of ASCII digits are compared by numeric value; equal
/// values with differing zero padding fall back to run length.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut lhs = a.chars().peekable();
    let mut rhs = b.chars().peekable();
    loop {
        match (lhs.peek().copied(), rhs.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let xs = take_digits(&mut lhs);
                let ys = take_digits(&mut rhs);
                let xt = xs.trim_start_matches('0');
                let yt = ys.trim_start_matches('0');
                let ordering = xt.len().cmp(&yt.len()).then_with(|| xt.cmp(yt));
                if ordering != Ordering::Equal {
                    return ordering;
                }
                if xs.len() != ys.len() {
                    return xs.len().cmp(&ys.len());
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                lhs.next();
                rhs.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek() {
        if c.is_ascii_digit() {
            run.push(*c);
            chars.next();
        } else {
            break;
        }
    }
    run
}

/// Decode a possibly merged annotation value into its member values.
///
/// Bracketed values are speculatively parsed as a JSON string array; on
/// parse failure the whole value is kept as a single opaque string.
pub(crate) fn decode_array_value(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(values) = serde_json::from_str::<Vec<String>>(trimmed) {
            return values;
        }
        trace!(value, "annotation value looks bracketed but is not a JSON string array");
    }
    vec![value.to_owned()]
}

/// Re-encode member values. A single value stays a bare scalar so that
/// round-tripping never introduces bracket syntax.
pub(crate) fn encode_array_value(values: Vec<String>) -> String {
    if values.len() > 1 {
        serde_json::to_string(&values).expect("string arrays must be encodable")
    } else {
        values.into_iter().next().unwrap_or_default()
    }
}

/// An immutable name/value pair attached to a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextAnnotation {
    name: String,
    value: String,
}

impl TextAnnotation {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the value encodes multiple merged values.
    pub fn is_array(&self) -> bool {
        let trimmed = self.value.trim();
        trimmed.starts_with('[')
            && trimmed.ends_with(']')
            && serde_json::from_str::<Vec<String>>(trimmed).is_ok()
    }

    /// The member values, or a one-element array for a scalar or unparseable
    /// value.
    pub fn to_array(&self) -> Vec<String> {
        decode_array_value(&self.value)
    }
}

impl PartialOrd for TextAnnotation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TextAnnotation {
    fn cmp(&self, other: &Self) -> Ordering {
        natural_cmp(&self.value, &other.value).then_with(|| natural_cmp(&self.name, &other.name))
    }
}

impl fmt::Display for TextAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// A named reference to a stored data item, attached to a row alongside the
/// text annotations.
#[derive(Clone)]
pub struct DataAnnotation {
    name: String,
    store: Arc<DataItemStore>,
}

impl DataAnnotation {
    pub fn new(name: impl Into<String>, store: Arc<DataItemStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<DataItemStore> {
        &self.store
    }

    /// Deep copy of the referenced item under the same name.
    pub fn duplicate(&self, progress: &Progress) -> Result<DataAnnotation, Error> {
        Ok(DataAnnotation {
            name: self.name.clone(),
            store: Arc::new(self.store.duplicate(progress)?),
        })
    }
}

impl fmt::Debug for DataAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAnnotation")
            .field("name", &self.name)
            .field("type", &self.store.type_tag())
            .finish()
    }
}
