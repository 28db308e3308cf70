//! Index limit expressions
//!
//! Node configuration can restrict iteration-step generation to a subset of
//! step indices with expressions like `"0-4,7,10-12"`. The limit is applied
//! after grouping and key-sorting, so the indices it refers to are stable.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use winnow::{
    Parser as _,
    ascii::{dec_uint, space0},
    combinator::{delimited, opt, preceded, separated},
};

use crate::Error;

type ParseResult<T> = Result<T, winnow::error::ErrMode<winnow::error::ContextError>>;

/// A set of allowed step indices, stored as inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexLimit {
    ranges: Vec<(usize, usize)>,
}

fn range(input: &mut &str) -> ParseResult<(usize, usize)> {
    let start: usize = dec_uint.parse_next(input)?;
    let end: Option<usize> = opt(preceded('-', dec_uint)).parse_next(input)?;
    Ok((start, end.unwrap_or(start)))
}

fn ranges(input: &mut &str) -> ParseResult<Vec<(usize, usize)>> {
    separated(1.., delimited(space0, range, space0), ',').parse_next(input)
}

impl IndexLimit {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut rest = input.trim();
        let ranges = ranges(&mut rest).map_err(|error| Error::InvalidLimit {
            input: input.to_owned(),
            reason: error.to_string(),
        })?;
        if !rest.is_empty() {
            return Err(Error::InvalidLimit {
                input: input.to_owned(),
                reason: format!("trailing input '{rest}'"),
            });
        }
        for (start, end) in &ranges {
            if start > end {
                return Err(Error::InvalidLimit {
                    input: input.to_owned(),
                    reason: format!("descending range {start}-{end}"),
                });
            }
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, index: usize) -> bool {
        self.ranges
            .iter()
            .any(|(start, end)| (*start..=*end).contains(&index))
    }

    /// All allowed indices in expression order.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|(start, end)| *start..=*end)
    }
}

impl FromStr for IndexLimit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IndexLimit {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IndexLimit> for String {
    fn from(limit: IndexLimit) -> Self {
        limit.to_string()
    }
}

impl fmt::Display for IndexLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (start, end)) in self.ranges.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
