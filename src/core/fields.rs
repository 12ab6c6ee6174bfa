//! Keyed and positional parameter containers.
//!
//! Both render through the same escaping rules: the wire form escapes every
//! value, the display form shows values as-is for logs and diagnostics.

use std::collections::BTreeMap;

use crate::core::message::{escape, unescape};
use crate::error::Result;

/// Rendering capability shared by [`FieldMap`] and [`FieldSlice`].
pub trait FieldFormat {
    /// Escaped, space-joined form as it appears on the wire.
    fn wire(&self) -> String;

    /// Unescaped, space-joined form for humans.
    fn display(&self) -> String;
}

/// Two-character keys mapped to (unescaped) values, e.g. `NI`, `ID`, `SI`.
///
/// Entry order carries no meaning on the wire; keys are kept sorted so the
/// rendered form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<String, String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `KEYvalue` parameters. Parameters shorter than a key are skipped,
    /// a repeated key keeps its last value.
    pub fn from_params<'a, I>(params: I) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        let fields = params
            .into_iter()
            .filter(|p| p.len() >= 2 && p.is_char_boundary(2))
            .map(|p| (p[..2].to_string(), p[2..].to_string()))
            .collect();
        Self { fields }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Merge `other` over `self`. An empty value removes the key, as in an
    /// incremental `INF` update.
    pub fn merge(&mut self, other: FieldMap) {
        for (key, value) in other.fields {
            if value.is_empty() {
                self.fields.remove(&key);
            } else {
                self.fields.insert(key, value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `KEYvalue` parameters in key order, ready for [`Message::new`](crate::core::message::Message::new).
    pub fn to_params(&self) -> Vec<String> {
        self.fields.iter().map(|(k, v)| format!("{k}{v}")).collect()
    }
}

impl FieldFormat for FieldMap {
    fn wire(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}{}", escape(v)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn display(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Ordered tokens, e.g. a `SUP` feature list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSlice {
    items: Vec<String>,
}

impl FieldSlice {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from already-escaped wire tokens.
    pub fn from_wire(tokens: &[&str]) -> Result<Self> {
        let items = tokens
            .iter()
            .map(|t| unescape(t).map(|v| v.into_owned()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { items })
    }

    pub fn push(&mut self, item: impl Into<String>) {
        self.items.push(item.into());
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.iter().any(|i| i == item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_inner(self) -> Vec<String> {
        self.items
    }
}

impl FieldFormat for FieldSlice {
    fn wire(&self) -> String {
        self.items
            .iter()
            .map(|i| escape(i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn display(&self) -> String {
        self.items.join(" ")
    }
}
