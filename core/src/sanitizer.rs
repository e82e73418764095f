//! Repairs raw direct-message payloads so strict extraction can succeed.
//!
//! Upstream emits the same logical timestamp in seconds, milliseconds or
//! microseconds, and Reels items frequently carry half-populated
//! `original_sound_info` records. Both break typed parsing of otherwise
//! readable messages.

use serde_json::{json, Map, Number, Value};
use thiserror::Error;
use tracing::debug;

use crate::error::CoreError;

/// 9999-12-31T23:59:59Z, the last second strict parsing accepts.
pub const MAX_EPOCH_SECONDS: i64 = 253_402_300_799;
const MAX_SCALE_DIVISIONS: usize = 2;
const MAX_DEPTH: usize = 64;
pub const THREAD_ITEM_LIMIT: usize = 20;

const MEDIA_CONTAINERS: &[&str] = &["media", "media_share", "visual_media", "raven_media", "video", "photo"];
const CLIP_ONLY_FIELDS: &[&str] = &["clips_metadata", "original_sound_info"];
const NULL_REJECTED_FIELDS: &[&str] = &["music_info", "template_info"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecoverable item: {reason}")]
pub struct Unrecoverable {
    pub reason: String,
}

impl Unrecoverable {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl From<Unrecoverable> for CoreError {
    fn from(err: Unrecoverable) -> Self {
        CoreError::MediaValidation(err.reason)
    }
}

/// Scales an epoch value down to seconds: divide by 1000 at most twice, then clamp.
pub fn normalize_epoch(value: i128) -> i64 {
    let mut normalized = value;
    for _ in 0..MAX_SCALE_DIVISIONS {
        if normalized <= MAX_EPOCH_SECONDS as i128 {
            break;
        }
        normalized /= 1000;
    }
    if normalized > MAX_EPOCH_SECONDS as i128 {
        return MAX_EPOCH_SECONDS;
    }
    // Below i64::MIN only for absurd negatives; those stay invalid for the parser.
    i64::try_from(normalized).unwrap_or(i64::MIN)
}

/// Reads a numeric or digit-string epoch value as a wide integer.
pub(crate) fn epoch_value(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(v as i128)
            } else if let Some(v) = n.as_u64() {
                Some(v as i128)
            } else {
                let f = n.as_f64()?;
                if !f.is_finite() {
                    return None;
                }
                Some(f.trunc() as i128)
            }
        }
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            // Digit strings too long for i128 are certainly out of range.
            Some(s.parse::<i128>().unwrap_or(i128::MAX))
        }
        _ => None,
    }
}

fn normalize_timestamp_value(value: &Value) -> Option<Value> {
    let raw = epoch_value(value)?;
    Some(Value::Number(Number::from(normalize_epoch(raw))))
}

fn normalize_timestamps(value: &mut Value, depth: usize) -> Result<(), Unrecoverable> {
    if depth > MAX_DEPTH {
        return Err(Unrecoverable::new("payload nested too deeply"));
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                normalize_timestamps(child, depth + 1)?;
                if key.contains("timestamp") {
                    if let Some(normalized) = normalize_timestamp_value(child) {
                        *child = normalized;
                    }
                }
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                normalize_timestamps(child, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn default_artist() -> Value {
    json!({ "username": "", "pk": 0 })
}

fn default_sound_info() -> Value {
    json!({
        "audio_id": "",
        "original_audio_title": "",
        "progressive_download_url": "",
        "dash_manifest": "",
        "ig_artist": default_artist(),
        "duration_in_ms": 0,
        "is_explicit": false
    })
}

fn fill_missing(target: &mut Map<String, Value>, defaults: &Value) {
    if let Value::Object(defaults) = defaults {
        for (key, default) in defaults {
            let missing = matches!(target.get(key), None | Some(Value::Null));
            if missing {
                target.insert(key.clone(), default.clone());
            }
        }
    }
}

fn repair_sound_info(metadata: &mut Map<String, Value>) {
    match metadata.get_mut("original_sound_info") {
        Some(Value::Object(info)) => {
            fill_missing(info, &default_sound_info());
            match info.get_mut("ig_artist") {
                Some(Value::Object(artist)) => fill_missing(artist, &default_artist()),
                _ => {
                    info.insert("ig_artist".to_string(), default_artist());
                }
            }
        }
        _ => {
            metadata.insert("original_sound_info".to_string(), default_sound_info());
        }
    }
}

fn repair_clip(item: &mut Map<String, Value>) {
    let Some(Value::Object(outer)) = item.get_mut("clip") else {
        return;
    };
    let clip = if outer.contains_key("clip") {
        match outer.get_mut("clip") {
            Some(Value::Object(inner)) => inner,
            _ => return,
        }
    } else {
        outer
    };
    if let Some(Value::Object(metadata)) = clip.get_mut("clips_metadata") {
        repair_sound_info(metadata);
        for field in NULL_REJECTED_FIELDS {
            if matches!(metadata.get(*field), Some(Value::Null)) {
                metadata.remove(*field);
            }
        }
    }
}

fn strip_clip_fields(container: &mut Map<String, Value>) {
    for field in CLIP_ONLY_FIELDS {
        container.remove(*field);
    }
}

fn strip_foreign_clip_fields(item: &mut Map<String, Value>) {
    for key in MEDIA_CONTAINERS {
        if let Some(Value::Object(container)) = item.get_mut(*key) {
            strip_clip_fields(container);
            if let Some(Value::Object(nested)) = container.get_mut("media") {
                strip_clip_fields(nested);
            }
        }
    }
}

/// Repairs one raw message item. The input is never modified.
pub fn sanitize_item(item: &Value) -> Result<Value, Unrecoverable> {
    if !item.is_object() {
        return Err(Unrecoverable::new("item is not an object"));
    }
    let mut cleaned = item.clone();
    normalize_timestamps(&mut cleaned, 0)?;
    let map = cleaned
        .as_object_mut()
        .ok_or_else(|| Unrecoverable::new("item is not an object"))?;
    repair_clip(map);
    strip_foreign_clip_fields(map);
    Ok(cleaned)
}

/// [`sanitize_item`] with the "None means skip" contract used by the batch loops.
pub fn clean_item(item: &Value) -> Option<Value> {
    match sanitize_item(item) {
        Ok(cleaned) => Some(cleaned),
        Err(err) => {
            debug!(error = %err, "dropping raw item");
            None
        }
    }
}

/// Repairs a raw inbox thread, keeping at most its newest [`THREAD_ITEM_LIMIT`] items.
pub fn sanitize_thread(thread: &Value) -> Result<Value, Unrecoverable> {
    let Value::Object(source) = thread else {
        return Err(Unrecoverable::new("thread is not an object"));
    };
    let mut cleaned = source.clone();
    if let Some(Value::Array(items)) = source.get("items") {
        let kept: Vec<Value> = items
            .iter()
            .take(THREAD_ITEM_LIMIT)
            .filter_map(clean_item)
            .collect();
        cleaned.insert("items".to_string(), Value::Array(kept));
    }
    Ok(Value::Object(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(item: &Value) -> &Value {
        &item["timestamp"]
    }

    #[test]
    fn scales_millis_and_micros_to_seconds() {
        let out = sanitize_item(&json!({"timestamp": 1_700_000_000_000i64})).expect("ms");
        assert_eq!(ts(&out), &json!(1_700_000_000));
        let out = sanitize_item(&json!({"timestamp": 1_700_000_000_000_000i64})).expect("us");
        assert_eq!(ts(&out), &json!(1_700_000_000));
        let out = sanitize_item(&json!({"timestamp": 1_700_000_000})).expect("s");
        assert_eq!(ts(&out), &json!(1_700_000_000));
    }

    #[test]
    fn clamps_values_beyond_two_divisions() {
        let out = sanitize_item(&json!({"timestamp": 9_999_999_999_999_999i64})).expect("clamp");
        assert_eq!(ts(&out), &json!(MAX_EPOCH_SECONDS));
        let out = sanitize_item(&json!({"timestamp": "99999999999999999999999999999999999999999"})).expect("huge");
        assert_eq!(ts(&out), &json!(MAX_EPOCH_SECONDS));
    }

    #[test]
    fn normalizes_nested_and_string_timestamps() {
        let item = json!({
            "timestamp_us": "1700000000000000",
            "reactions": {"emojis": [{"timestamp": 1_700_000_000_123i64}]},
            "not_a_time": 1_700_000_000_000i64,
            "timestamp_label": "yesterday"
        });
        let out = sanitize_item(&item).expect("nested");
        assert_eq!(out["timestamp_us"], json!(1_700_000_000));
        assert_eq!(out["reactions"]["emojis"][0]["timestamp"], json!(1_700_000_000));
        assert_eq!(out["not_a_time"], json!(1_700_000_000_000i64));
        assert_eq!(out["timestamp_label"], json!("yesterday"));
    }

    #[test]
    fn synthesizes_missing_sound_info() {
        let item = json!({
            "item_id": "1",
            "clip": {"clip": {"clips_metadata": {"original_sound_info": null, "music_info": null, "template_info": null}}}
        });
        let out = sanitize_item(&item).expect("clip");
        let meta = &out["clip"]["clip"]["clips_metadata"];
        let info = meta["original_sound_info"].as_object().expect("sound info");
        for key in ["audio_id", "original_audio_title", "progressive_download_url", "dash_manifest", "duration_in_ms", "is_explicit", "ig_artist"] {
            assert!(info.contains_key(key), "{key}");
        }
        assert_eq!(info["ig_artist"], json!({"username": "", "pk": 0}));
        assert!(meta.get("music_info").is_none());
        assert!(meta.get("template_info").is_none());
    }

    #[test]
    fn fills_partial_sound_info_without_discarding() {
        let item = json!({
            "clip": {"clips_metadata": {
                "original_sound_info": {"audio_id": "42", "ig_artist": {"username": "dj"}},
                "music_info": {"id": 3}
            }}
        });
        let out = sanitize_item(&item).expect("clip");
        let meta = &out["clip"]["clips_metadata"];
        assert_eq!(meta["original_sound_info"]["audio_id"], json!("42"));
        assert_eq!(meta["original_sound_info"]["ig_artist"], json!({"username": "dj", "pk": 0}));
        assert_eq!(meta["original_sound_info"]["is_explicit"], json!(false));
        assert_eq!(meta["music_info"], json!({"id": 3}));
    }

    #[test]
    fn replaces_malformed_artist() {
        let item = json!({"clip": {"clips_metadata": {"original_sound_info": {"ig_artist": "nobody"}}}});
        let out = sanitize_item(&item).expect("clip");
        assert_eq!(out["clip"]["clips_metadata"]["original_sound_info"]["ig_artist"], default_artist());
    }

    #[test]
    fn strips_clip_fields_from_plain_media() {
        let item = json!({
            "media": {"media_type": 1, "clips_metadata": {}, "original_sound_info": null},
            "visual_media": {"media": {"media_type": 2, "clips_metadata": null}}
        });
        let out = sanitize_item(&item).expect("media");
        assert!(out["media"].get("clips_metadata").is_none());
        assert!(out["media"].get("original_sound_info").is_none());
        assert!(out["visual_media"]["media"].get("clips_metadata").is_none());
        assert_eq!(out["media"]["media_type"], json!(1));
    }

    #[test]
    fn leaves_input_untouched() {
        let item = json!({"timestamp": 1_700_000_000_000i64, "clip": {"clips_metadata": {}}});
        let before = item.clone();
        let _ = sanitize_item(&item).expect("sanitize");
        assert_eq!(item, before);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(sanitize_item(&json!([1, 2])).is_err());
        assert!(clean_item(&json!("text")).is_none());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let samples = vec![
            json!({"timestamp": 9_999_999_999_999_999i64, "clip": {"clip": {"clips_metadata": {"original_sound_info": 5, "music_info": null}}}}),
            json!({"timestamp": "1700000000000", "media": {"clips_metadata": {}}, "clip": {"clips_metadata": null}}),
            json!({"item_id": "x", "timestamp": 12.9, "clip": {"clips_metadata": {"original_sound_info": {"ig_artist": null}}}}),
        ];
        for sample in samples {
            let once = sanitize_item(&sample).expect("once");
            let twice = sanitize_item(&once).expect("twice");
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn thread_items_are_capped_and_bad_items_dropped() {
        let mut items: Vec<Value> = (0..25)
            .map(|i| json!({"item_id": i.to_string(), "timestamp": 1_700_000_000_000_000i64 + i}))
            .collect();
        items[3] = json!("garbage");
        let thread = json!({"thread_id": "t", "items": items});
        let out = sanitize_thread(&thread).expect("thread");
        let kept = out["items"].as_array().expect("items");
        assert_eq!(kept.len(), THREAD_ITEM_LIMIT - 1);
        assert_eq!(kept[0]["timestamp"], json!(1_700_000_000));
    }
}
