//! Reorder input files by fields captured from their names.
//!
//! A pattern names its sort fields `int0`, `string0`, `int1`, ... in priority
//! order. `intN` groups compare numerically, `stringN` groups lexically.
//! Names the pattern does not match keep their relative order after all
//! matching names.

use std::cmp::Ordering;

use regex::Regex;
use thiserror::Error;

use crate::types::InputImage;

/// Pattern for files named by page number, e.g. `12.jpg`.
pub const NUMBERED: &str = r"^(?<int0>[0-9]+)\.\w+$";

/// Pattern for plain lexical ordering by stem.
pub const STRING: &str = r"^(?<string0>.*)\.\w+$";

#[derive(Debug, Error)]
pub enum OrderingError {
    #[error("invalid ordering pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("ordering pattern has no int0 or string0 group")]
    NoFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Int,
    Str,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Int(Option<u64>),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct PageOrdering {
    regex: Regex,
    /// (group name, kind) in priority order
    fields: Vec<(String, Field)>,
}

impl PageOrdering {
    pub fn new(pattern: &str) -> Result<Self, OrderingError> {
        let regex = Regex::new(pattern)?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();

        let mut fields = Vec::new();
        for i in 0.. {
            let int = format!("int{i}");
            let string = format!("string{i}");
            if names.contains(&int.as_str()) {
                fields.push((int, Field::Int));
            } else if names.contains(&string.as_str()) {
                fields.push((string, Field::Str));
            } else {
                break;
            }
        }

        if fields.is_empty() {
            return Err(OrderingError::NoFields);
        }
        Ok(Self { regex, fields })
    }

    fn key(&self, name: &str) -> Option<Vec<SortValue>> {
        let caps = self.regex.captures(name)?;
        let key = self
            .fields
            .iter()
            .map(|(group, field)| {
                let text = caps.name(group).map(|m| m.as_str()).unwrap_or_default();
                match field {
                    Field::Int => SortValue::Int(text.parse().ok()),
                    Field::Str => SortValue::Str(text.to_string()),
                }
            })
            .collect();
        Some(key)
    }

    /// Compare two file names.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match (self.key(a), self.key(b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Stable sort of images by name.
    pub fn sort(&self, images: &mut [InputImage]) {
        images.sort_by_cached_key(|image| {
            let key = self.key(&image.name);
            (key.is_none(), key)
        });
    }
}
