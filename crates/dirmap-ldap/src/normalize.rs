//! Wire entries to canonical entries.
//!
//! Single-valued attributes become scalars, multi-valued attributes become
//! ordered arrays, and attributes with no values become null. An attribute
//! named `dn` is dropped so it cannot shadow the entry's DN.

use dirmap::operation::{is_dn_attribute, AttributeSet, AttributeValue, CanonicalEntry};

use crate::raw::{RawEntry, RawItem, RawValue};

/// Normalize one wire entry.
pub fn normalize(raw: &RawEntry) -> CanonicalEntry {
    let attributes: AttributeSet = raw
        .attribute_names()
        .iter()
        .filter(|name| !is_dn_attribute(name))
        .map(|name| {
            let values = raw.values(name).unwrap_or_default();
            (name.clone(), collapse(values))
        })
        .collect();

    CanonicalEntry {
        dn: raw.dn.clone(),
        attributes,
    }
}

/// Normalize every entry of a result set, skipping references.
pub fn normalize_all(items: &[RawItem]) -> Vec<CanonicalEntry> {
    items
        .iter()
        .filter_map(|item| match item {
            RawItem::Entry(entry) => Some(normalize(entry)),
            RawItem::Reference => None,
        })
        .collect()
}

fn collapse(values: &[RawValue]) -> AttributeValue {
    match values {
        [] => AttributeValue::Null,
        [single] => scalar(single),
        many => AttributeValue::Array(many.iter().map(scalar).collect()),
    }
}

fn scalar(value: &RawValue) -> AttributeValue {
    match value {
        RawValue::Text(s) => AttributeValue::String(s.clone()),
        RawValue::Binary(b) => AttributeValue::Binary(b.clone()),
    }
}
