//! Change detection between a record and its last-synced snapshot.
//!
//! The diff only reports fields that are new or changed in the current data.
//! Fields removed from the data are not represented; a removed attribute is
//! never turned into a delete.

use std::collections::BTreeMap;

use crate::operation::{AttributeSet, AttributeValue};

/// Compute the fields of `data` that differ from `snapshot`.
///
/// - fields missing from `snapshot` are included as-is
/// - nested maps present on both sides are compared recursively and
///   included only when the nested diff is non-empty
/// - any other value (scalars, lists) is included when not equal
pub fn recursive_diff(data: &AttributeSet, snapshot: &AttributeSet) -> AttributeSet {
    data.iter()
        .filter_map(|(name, value)| {
            diff_value(value, snapshot.get(name)).map(|changed| (name.clone(), changed))
        })
        .collect()
}

fn diff_value(
    current: &AttributeValue,
    previous: Option<&AttributeValue>,
) -> Option<AttributeValue> {
    let Some(previous) = previous else {
        return Some(current.clone());
    };

    match (current, previous) {
        (AttributeValue::Object(current), AttributeValue::Object(previous)) => {
            let nested = diff_map(current, previous);
            (!nested.is_empty()).then_some(AttributeValue::Object(nested))
        }
        _ => (current != previous).then(|| current.clone()),
    }
}

fn diff_map(
    current: &BTreeMap<String, AttributeValue>,
    previous: &BTreeMap<String, AttributeValue>,
) -> BTreeMap<String, AttributeValue> {
    current
        .iter()
        .filter_map(|(name, value)| {
            diff_value(value, previous.get(name)).map(|changed| (name.clone(), changed))
        })
        .collect()
}
