//! Normalization of list responses.
//!
//! Depending on the endpoint, the backend answers a list request with a bare
//! array, with `{"data": [...]}`, or with the array under a resource name
//! (`{"alumnos": [...], "total": 40}`, sometimes nested inside `data`).

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

/// Wrapper keys tried after the caller's resource-specific keys.
const GENERIC_KEYS: [&str; 3] = ["data", "items", "results"];

/// One page of a list response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// The backend's `total` if it sent one, otherwise the item count.
    pub total: usize,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// Locate the array in a list response.
///
/// `keys` are the resource-specific names to probe first, e.g.
/// `["alumnos", "estudiantes"]`.
fn locate<'a>(value: &'a Value, keys: &[&str], depth: usize) -> Option<&'a Vec<Value>> {
    if let Value::Array(items) = value {
        return Some(items);
    }
    let object = value.as_object()?;

    for key in keys.iter().chain(GENERIC_KEYS.iter()) {
        match object.get(*key) {
            Some(Value::Array(items)) => return Some(items),
            Some(nested @ Value::Object(_)) if depth == 0 => {
                if let Some(items) = locate(nested, keys, depth + 1) {
                    return Some(items);
                }
            }
            _ => {}
        }
    }

    // Last resort: the only array-valued field
    let mut arrays = object.values().filter_map(Value::as_array);
    match (arrays.next(), arrays.next()) {
        (Some(items), None) => Some(items),
        _ => None,
    }
}

fn total_of(value: &Value) -> Option<usize> {
    let object = value.as_object()?;
    object
        .get("total")
        .or_else(|| object.get("data").and_then(|data| data.get("total")))
        .and_then(Value::as_u64)
        .map(|total| total as usize)
}

/// Extract a typed page from a list response.
///
/// A response with no recognizable array yields an empty page; a response
/// whose array holds the wrong shape is an error.
pub fn extract_page<T: DeserializeOwned>(
    value: &Value,
    keys: &[&str],
) -> Result<Page<T>, serde_json::Error> {
    let Some(items) = locate(value, keys, 0) else {
        warn!(?keys, "No list found in response, treating it as empty");
        return Ok(Page::empty());
    };

    let items: Vec<T> = items
        .iter()
        .map(|item| T::deserialize(item))
        .collect::<Result<_, _>>()?;
    let total = total_of(value).unwrap_or(items.len());
    debug!(count = items.len(), total, "Extracted list response");

    Ok(Page { items, total })
}
