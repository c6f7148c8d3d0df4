//! Deep merge of configuration layers.

use serde_json::Value;

/// Merges `overlay` into `base` in place.
///
/// Mappings merge key by key, sequences concatenate (base first), and any
/// other pairing replaces the base value with the overlay.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(overlay_items)) => {
            base_items.extend(overlay_items);
        }
        (slot, value) => *slot = value,
    }
}
