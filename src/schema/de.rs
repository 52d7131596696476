use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;

/// Deserializes the `_extra` fields of a role, dropping the `_type` tag that serde has already
/// consumed as the enum discriminator.
pub(super) fn extra_skip_type<'de, D>(deserializer: D) -> Result<HashMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut map: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    map.remove("_type");
    Ok(map)
}
