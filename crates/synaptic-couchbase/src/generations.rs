//! Encoding of cached generation lists.
//!
//! The current format is a JSON array of strings, each string being one
//! independently serialized [`Generation`]. Blobs written by older clients are
//! a plain JSON array of `{"text": ..., "generation_info": ...}` objects; they
//! are still readable and decode to [`Generation::Text`].

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use synaptic_core::Generation;

use crate::CouchbaseError;

#[derive(Deserialize)]
struct LegacyGeneration {
    text: String,
    #[serde(default)]
    generation_info: Option<HashMap<String, Value>>,
}

/// Serialize generations into the current cache blob format.
pub fn dumps_generations(generations: &[Generation]) -> Result<String, CouchbaseError> {
    let items = generations
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serde_json::to_string(&items)?)
}

/// Deserialize a cache blob, falling back to the legacy format.
///
/// Never fails: an unreadable blob is logged and treated as a cache miss.
pub fn loads_generations(blob: &str) -> Option<Vec<Generation>> {
    if let Some(generations) = loads_current(blob) {
        return Some(generations);
    }

    match serde_json::from_str::<Vec<LegacyGeneration>>(blob) {
        Ok(items) => {
            tracing::warn!(blob = %blob, "legacy 'Generation' cached blob encountered");
            Some(
                items
                    .into_iter()
                    .map(|item| Generation::Text {
                        text: item.text,
                        generation_info: item.generation_info,
                    })
                    .collect(),
            )
        }
        Err(_) => {
            tracing::warn!(blob = %blob, "malformed/unparsable cached blob encountered");
            None
        }
    }
}

fn loads_current(blob: &str) -> Option<Vec<Generation>> {
    let items: Vec<String> = serde_json::from_str(blob).ok()?;
    items
        .iter()
        .map(|item| serde_json::from_str::<Generation>(item))
        .collect::<Result<Vec<_>, _>>()
        .ok()
}
