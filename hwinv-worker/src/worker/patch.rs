//! Normalization applied to an external object and its desired state
//! before they are diffed into an RFC 6902 patch with `json_patch::diff`.

use serde_json::{Map, Value};

/// Prepare a pair of objects for diffing.
///
/// Keys only the external side knows about are copied into `desired` so the
/// patch leaves them alone. A desired `null` means "remove": the key is
/// dropped from `desired`, and from `existing` too when it has no value
/// there either, so no no-op removal is emitted.
pub fn normalize_for_patch(existing: &mut Map<String, Value>, desired: &mut Map<String, Value>) {
    for (key, value) in existing.iter() {
        desired.entry(key.clone()).or_insert_with(|| value.clone());
    }

    let nulled: Vec<String> = desired
        .iter()
        .filter(|(_, v)| v.is_null())
        .map(|(k, _)| k.clone())
        .collect();
    for key in nulled {
        desired.remove(&key);
        if existing.get(&key).is_none_or(Value::is_null) {
            existing.remove(&key);
        }
    }
}

/// Normalize the object found at `key` on both sides, if both are objects
/// (a missing or null `existing` side is treated as empty).
pub fn normalize_nested(existing: &mut Value, desired: &mut Value, key: &str) {
    let Some(desired_obj) = desired.get_mut(key).and_then(Value::as_object_mut) else {
        return;
    };
    let Some(existing_root) = existing.as_object_mut() else {
        return;
    };
    let slot = existing_root
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    if let Some(existing_obj) = slot.as_object_mut() {
        normalize_for_patch(existing_obj, desired_obj);
    }
}
