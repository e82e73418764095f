//! Strict conversion of raw API records into [`Message`] and [`Thread`].
//!
//! Mirrors the upstream schema: Reels metadata must be complete, nullable
//! extras must be absent rather than null, and timestamps are epoch seconds
//! no later than year 9999. Raw records usually need
//! [`crate::sanitizer::sanitize_item`] first.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, Error as DeError};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{Media, MediaKind, Message, Thread, User};
use crate::sanitizer::{epoch_value, normalize_epoch, MAX_EPOCH_SECONDS};

const MEDIA_TYPE_IMAGE: i64 = 1;
const MEDIA_TYPE_VIDEO: i64 = 2;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("schema mismatch: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("thread item {index}: {source}")]
    ThreadItem {
        index: usize,
        #[source]
        source: Box<ParseError>,
    },
}

fn de_pk<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let pk = match &raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    };
    pk.ok_or_else(|| D::Error::custom(format!("expected numeric id, got {raw}")))
}

fn de_string_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected string id, got {other}"))),
    }
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let secs = epoch_value(&raw)
        .ok_or_else(|| D::Error::custom(format!("timestamp must be numeric, got {raw}")))?;
    if secs > MAX_EPOCH_SECONDS as i128 {
        return Err(D::Error::custom(format!("timestamp {secs} out of range for datetime")));
    }
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| D::Error::custom(format!("timestamp {secs} out of range for datetime")))
}

// Thread activity markers are informational, so any epoch scale is accepted.
fn de_activity_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(epoch_value)
        .map(normalize_epoch)
        .and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

fn reject_clip_field<'de, D>(deserializer: D) -> Result<Option<()>, D::Error>
where
    D: Deserializer<'de>,
{
    let _ = serde::de::IgnoredAny::deserialize(deserializer)?;
    Err(D::Error::custom("clip metadata is only valid on clip media"))
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawImageVersions {
    #[serde(default)]
    candidates: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    #[serde(default)]
    media_type: Option<i64>,
    #[serde(default)]
    image_versions2: Option<RawImageVersions>,
    #[serde(default)]
    video_versions: Option<Vec<RawCandidate>>,
    #[serde(default, deserialize_with = "reject_clip_field")]
    #[allow(dead_code)]
    clips_metadata: Option<()>,
    #[serde(default, deserialize_with = "reject_clip_field")]
    #[allow(dead_code)]
    original_sound_info: Option<()>,
}

impl RawMedia {
    fn image_url(&self) -> Option<String> {
        self.image_versions2
            .as_ref()
            .and_then(|v| v.candidates.first())
            .map(|c| c.url.clone())
    }

    fn video_url(&self) -> Option<String> {
        self.video_versions
            .as_ref()
            .and_then(|v| v.first())
            .map(|c| c.url.clone())
    }

    fn to_media(&self) -> Option<Media> {
        match self.media_type {
            Some(MEDIA_TYPE_IMAGE) => Some(Media {
                kind: MediaKind::Image,
                url: self.image_url(),
            }),
            Some(MEDIA_TYPE_VIDEO) => Some(Media {
                kind: MediaKind::Video,
                url: self.video_url(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVisualMedia {
    #[serde(default)]
    media: Option<RawMedia>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawArtist {
    username: String,
    #[serde(deserialize_with = "de_pk")]
    pk: u64,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawSoundInfo {
    #[serde(deserialize_with = "de_string_id")]
    audio_id: String,
    original_audio_title: String,
    progressive_download_url: String,
    dash_manifest: String,
    ig_artist: RawArtist,
    duration_in_ms: i64,
    is_explicit: bool,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawClipsMetadata {
    original_sound_info: RawSoundInfo,
    // Absent is fine, null is not.
    #[serde(default)]
    music_info: Map<String, Value>,
    #[serde(default)]
    template_info: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawClip {
    #[serde(default)]
    #[allow(dead_code)]
    clips_metadata: Option<RawClipsMetadata>,
    #[serde(default)]
    image_versions2: Option<RawImageVersions>,
    #[serde(default)]
    video_versions: Option<Vec<RawCandidate>>,
}

impl RawClip {
    fn to_media(&self) -> Media {
        let url = self
            .video_versions
            .as_ref()
            .and_then(|v| v.first())
            .or_else(|| self.image_versions2.as_ref().and_then(|v| v.candidates.first()))
            .map(|c| c.url.clone());
        Media {
            kind: MediaKind::Video,
            url,
        }
    }
}

fn parse_clip(clip: &Value) -> Result<Option<RawClip>, serde_json::Error> {
    let inner = match clip {
        Value::Null => return Ok(None),
        Value::Object(outer) => outer.get("clip").unwrap_or(clip),
        _ => clip,
    };
    RawClip::deserialize(inner).map(Some)
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(deserialize_with = "de_string_id")]
    item_id: String,
    #[serde(deserialize_with = "de_pk")]
    user_id: u64,
    #[serde(deserialize_with = "de_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    item_type: Option<String>,
    #[serde(default)]
    media: Option<RawMedia>,
    #[serde(default)]
    visual_media: Option<RawVisualMedia>,
    #[serde(default)]
    media_share: Option<RawMedia>,
    #[serde(default)]
    clip: Option<Value>,
}

pub fn extract_message(item: &Value) -> Result<Message, ParseError> {
    let raw = RawItem::deserialize(item)?;
    let clip = match &raw.clip {
        Some(clip) => parse_clip(clip)?,
        None => None,
    };
    let media = raw
        .media
        .as_ref()
        .and_then(RawMedia::to_media)
        .or_else(|| {
            raw.visual_media
                .as_ref()
                .and_then(|v| v.media.as_ref())
                .and_then(RawMedia::to_media)
        })
        .or_else(|| clip.as_ref().map(RawClip::to_media))
        .or_else(|| raw.media_share.as_ref().and_then(RawMedia::to_media));
    Ok(Message {
        id: raw.item_id,
        user_id: raw.user_id,
        text: raw.text,
        timestamp: raw.timestamp,
        item_type: raw.item_type,
        media,
    })
}

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(deserialize_with = "de_pk")]
    pk: u64,
    username: String,
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawThread {
    #[serde(deserialize_with = "de_string_id")]
    thread_id: String,
    #[serde(default)]
    thread_title: Option<String>,
    #[serde(default)]
    users: Vec<RawUser>,
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default, deserialize_with = "de_activity_time")]
    last_activity_at: Option<DateTime<Utc>>,
}

/// Parses a raw inbox thread. One bad preview item fails the whole thread.
pub fn extract_thread(thread: &Value) -> Result<Thread, ParseError> {
    let raw = RawThread::deserialize(thread)?;
    let messages = raw
        .items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            extract_message(item).map_err(|source| ParseError::ThreadItem {
                index,
                source: Box::new(source),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let users = raw
        .users
        .into_iter()
        .map(|u| User {
            pk: u.pk,
            username: u.username,
            full_name: u.full_name,
        })
        .collect();
    Ok(Thread {
        id: raw.thread_id,
        title: raw.thread_title,
        users,
        messages,
        last_activity_at: raw.last_activity_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::sanitize_item;
    use serde_json::json;

    fn text_item(ts: i64) -> Value {
        json!({"item_id": "1", "user_id": 7, "timestamp": ts, "item_type": "text", "text": "hi"})
    }

    #[test]
    fn parses_plain_text_message() {
        let msg = extract_message(&text_item(1_700_000_000)).expect("parse");
        assert_eq!(msg.id, "1");
        assert_eq!(msg.user_id, 7);
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(msg.text.as_deref(), Some("hi"));
        assert!(msg.media.is_none());
    }

    #[test]
    fn rejects_microsecond_timestamps_until_sanitized() {
        let raw = text_item(1_700_000_000_000_000);
        let err = extract_message(&raw).expect_err("overflow");
        assert!(err.to_string().contains("out of range"));
        let msg = extract_message(&sanitize_item(&raw).expect("sanitize")).expect("parse");
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn accepts_clamped_maximum() {
        let msg = extract_message(&text_item(MAX_EPOCH_SECONDS)).expect("parse");
        assert_eq!(msg.timestamp.format("%Y").to_string(), "9999");
    }

    #[test]
    fn clip_with_null_sound_info_needs_repair() {
        let raw = json!({
            "item_id": "2", "user_id": "8", "timestamp": 1_700_000_000, "item_type": "clip",
            "clip": {"clip": {
                "clips_metadata": {"original_sound_info": null, "music_info": null},
                "video_versions": [{"url": "https://cdn.example/clip.mp4"}]
            }}
        });
        assert!(extract_message(&raw).is_err());
        let msg = extract_message(&sanitize_item(&raw).expect("sanitize")).expect("parse");
        let media = msg.media.expect("media");
        assert_eq!(media.kind, MediaKind::Video);
        assert_eq!(media.url.as_deref(), Some("https://cdn.example/clip.mp4"));
    }

    #[test]
    fn plain_media_rejects_clip_fields() {
        let raw = json!({
            "item_id": "3", "user_id": 1, "timestamp": 1_700_000_000,
            "media": {"media_type": 1, "clips_metadata": {},
                      "image_versions2": {"candidates": [{"url": "https://cdn.example/a.jpg"}]}}
        });
        assert!(extract_message(&raw).is_err());
        let msg = extract_message(&sanitize_item(&raw).expect("sanitize")).expect("parse");
        assert_eq!(
            msg.media,
            Some(Media {
                kind: MediaKind::Image,
                url: Some("https://cdn.example/a.jpg".to_string())
            })
        );
    }

    #[test]
    fn parses_thread_with_users_and_preview() {
        let raw = json!({
            "thread_id": 123,
            "thread_title": "friends",
            "last_activity_at": 1_700_000_000_000_000i64,
            "users": [{"pk": "11", "username": "alice"}, {"pk": 12, "username": "bob", "full_name": "Bob"}],
            "items": [text_item(1_700_000_000)]
        });
        let thread = extract_thread(&raw).expect("thread");
        assert_eq!(thread.id, "123");
        assert_eq!(thread.usernames(), vec!["alice", "bob"]);
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.last_activity_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn bad_preview_item_fails_thread() {
        let raw = json!({"thread_id": "t", "items": [text_item(1), {"item_id": "x"}]});
        match extract_thread(&raw) {
            Err(ParseError::ThreadItem { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
