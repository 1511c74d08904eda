//! Entries as they come off the wire, before normalization.

use std::collections::HashMap;

use ldap3::{ResultEntry, SearchEntry};

use dirmap::operation::AttributeValue;

/// One attribute value as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    /// A value that decoded as UTF-8.
    Text(String),
    /// A value that did not.
    Binary(Vec<u8>),
}

impl RawValue {
    /// Wire values for a record value.
    ///
    /// Scalars become text, binary values pass through untouched, arrays
    /// flatten and null becomes no values. Returns `None` for nested maps,
    /// which have no directory form.
    pub fn encode(value: &AttributeValue) -> Option<Vec<RawValue>> {
        let encoded = match value {
            AttributeValue::Null => Vec::new(),
            AttributeValue::String(s) => vec![RawValue::Text(s.clone())],
            AttributeValue::Integer(i) => vec![RawValue::Text(i.to_string())],
            AttributeValue::Boolean(b) => {
                vec![RawValue::Text(if *b { "TRUE" } else { "FALSE" }.to_string())]
            }
            AttributeValue::Float(f) => vec![RawValue::Text(f.to_string())],
            AttributeValue::Binary(bytes) => vec![RawValue::Binary(bytes.clone())],
            AttributeValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.extend(Self::encode(item)?);
                }
                out
            }
            AttributeValue::Object(_) => return None,
        };
        Some(encoded)
    }

    /// The value's bytes as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawValue::Text(s) => s.as_bytes(),
            RawValue::Binary(b) => b,
        }
    }

    /// The value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s),
            RawValue::Binary(_) => None,
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

/// A directory entry in wire form.
///
/// Carries an ordered attribute-name list plus a per-name value list, so the
/// attribute order the server returned is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    /// Distinguished name.
    pub dn: String,
    attribute_names: Vec<String>,
    values_by_name: HashMap<String, Vec<RawValue>>,
}

impl RawEntry {
    /// Create an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Self::default()
        }
    }

    /// Append an attribute and its values.
    pub fn push_attribute(&mut self, name: impl Into<String>, values: Vec<RawValue>) {
        let name = name.into();
        if !self.values_by_name.contains_key(&name) {
            self.attribute_names.push(name.clone());
        }
        self.values_by_name.insert(name, values);
    }

    /// Append an attribute using builder pattern.
    pub fn with<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RawValue>,
    {
        self.push_attribute(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Attribute names in server order.
    pub fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    /// Values of one attribute, if the entry carries it.
    pub fn values(&self, name: &str) -> Option<&[RawValue]> {
        self.values_by_name.get(name).map(Vec::as_slice)
    }

    /// Number of attributes.
    pub fn attribute_count(&self) -> usize {
        self.attribute_names.len()
    }
}

impl From<SearchEntry> for RawEntry {
    fn from(entry: SearchEntry) -> Self {
        let mut raw = RawEntry::new(entry.dn);

        // ldap3 hands attributes back in a map; sort for a stable order.
        let mut text: Vec<_> = entry.attrs.into_iter().collect();
        text.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, values) in text {
            raw.push_attribute(name, values.into_iter().map(RawValue::Text).collect());
        }

        let mut binary: Vec<_> = entry.bin_attrs.into_iter().collect();
        binary.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, values) in binary {
            raw.push_attribute(name, values.into_iter().map(RawValue::Binary).collect());
        }

        raw
    }
}

/// One item of a raw result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawItem {
    /// A directory entry.
    Entry(RawEntry),
    /// A referral or other non-entry response.
    Reference,
}

impl From<RawEntry> for RawItem {
    fn from(entry: RawEntry) -> Self {
        RawItem::Entry(entry)
    }
}

impl From<ResultEntry> for RawItem {
    fn from(entry: ResultEntry) -> Self {
        if entry.is_ref() || entry.is_intermediate() {
            RawItem::Reference
        } else {
            RawItem::Entry(SearchEntry::construct(entry).into())
        }
    }
}
