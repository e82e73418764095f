//! Writes a fetched conversation to disk as plain text, JSON or CSV.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::config::ExportFormat;
use crate::error::CoreError;
use crate::messages::sort_by_timestamp;
use crate::models::{MediaKind, Message, Thread};

const HEADER_RULE_WIDTH: usize = 70;
const DATE_RULE_WIDTH: usize = 25;
const NO_TEXT: &str = "[No text content]";
const NO_URL: &str = "No URL";
const CSV_HEADER: [&str; 8] = [
    "Timestamp",
    "Date",
    "Time",
    "Sender",
    "Sender_ID",
    "Message",
    "Media_Type",
    "Media_URL",
];

/// Replaces characters that are not allowed in file names on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// Who the viewer is, so their own messages render with a name instead of an id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Viewer<'a> {
    pub user_id: Option<u64>,
    pub username: &'a str,
}

impl<'a> Viewer<'a> {
    pub fn new(user_id: u64, username: &'a str) -> Self {
        Self {
            user_id: Some(user_id),
            username,
        }
    }
}

struct Senders<'a> {
    names: HashMap<u64, &'a str>,
}

impl<'a> Senders<'a> {
    fn new(thread: &'a Thread, viewer: Viewer<'a>) -> Self {
        let mut names: HashMap<u64, &'a str> = thread
            .users
            .iter()
            .map(|u| (u.pk, u.username.as_str()))
            .collect();
        if let Some(id) = viewer.user_id {
            let name = if viewer.username.is_empty() { "You" } else { viewer.username };
            names.insert(id, name);
        }
        Self { names }
    }

    fn name(&self, user_id: u64) -> String {
        match self.names.get(&user_id) {
            Some(name) => (*name).to_string(),
            None => format!("Unknown ({user_id})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageExporter {
    save_dir: PathBuf,
}

impl MessageExporter {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Writes `messages` under `<save_dir>/<username>/` and returns the file path.
    /// The file name carries the timestamp of the oldest message, or now when empty.
    pub fn export(
        &self,
        thread: &Thread,
        messages: &[Message],
        format: ExportFormat,
        viewer: Viewer<'_>,
    ) -> Result<PathBuf, CoreError> {
        let mut sorted = messages.to_vec();
        sort_by_timestamp(&mut sorted);

        let stamp = sorted.first().map(|m| m.timestamp).unwrap_or_else(Utc::now);
        let body = match format {
            ExportFormat::Txt => render_txt(thread, &sorted, viewer),
            ExportFormat::Json => render_json(thread, &sorted, viewer)?,
            ExportFormat::Csv => render_csv(thread, &sorted, viewer),
        };

        let path = self.output_path(thread, format, stamp).and_then(|path| {
            fs::write(&path, body)?;
            Ok(path)
        });
        match path {
            Ok(path) => {
                info!(count = sorted.len(), path = %path.display(), "exported messages");
                Ok(path)
            }
            Err(err) => {
                error!(thread_id = %thread.id, error = %err, "failed to export messages");
                Err(CoreError::Export(format!("failed to export messages: {err}")))
            }
        }
    }

    fn output_path(&self, thread: &Thread, format: ExportFormat, stamp: DateTime<Utc>) -> Result<PathBuf, CoreError> {
        let safe_username = sanitize_filename(thread.primary_username());
        let folder = self.save_dir.join(&safe_username);
        fs::create_dir_all(&folder)?;
        let file_name = format!(
            "{}_{}.{}",
            safe_username,
            stamp.format("%Y-%m-%d_%H-%M-%S"),
            format.extension()
        );
        Ok(folder.join(file_name))
    }
}

fn render_txt(thread: &Thread, messages: &[Message], viewer: Viewer<'_>) -> String {
    let senders = Senders::new(thread, viewer);
    let rule = "\u{2015}".repeat(DATE_RULE_WIDTH);
    let mut out = String::new();
    let _ = writeln!(out, "Conversation with {}", thread.usernames().join(", "));
    let _ = writeln!(out, "{}\n", "=".repeat(HEADER_RULE_WIDTH));

    let mut current_date: Option<NaiveDate> = None;
    for msg in messages {
        let date = msg.timestamp.date_naive();
        if current_date != Some(date) {
            if current_date.is_some() {
                out.push('\n');
            }
            let _ = writeln!(out, "\n{rule} {} {rule}\n", date.format("%A, %B %d, %Y"));
            current_date = Some(date);
        }

        let text = msg.text.as_deref().unwrap_or(NO_TEXT);
        let _ = writeln!(
            out,
            "{} - {}: {}",
            msg.timestamp.format("%H:%M:%S"),
            senders.name(msg.user_id),
            text
        );
        if let Some(media) = &msg.media {
            let _ = writeln!(out, "  [{}: {}]", media.kind.label(), media.url.as_deref().unwrap_or(NO_URL));
        }
        out.push('\n');
    }
    out
}

#[derive(Serialize)]
struct JsonExport<'a> {
    conversation_info: ConversationInfo<'a>,
    messages: Vec<JsonMessage<'a>>,
}

#[derive(Serialize)]
struct ConversationInfo<'a> {
    participants: Vec<&'a str>,
    thread_id: &'a str,
    export_time: String,
    message_count: usize,
}

#[derive(Serialize)]
struct JsonMessage<'a> {
    timestamp: String,
    sender: String,
    sender_id: u64,
    text: Option<&'a str>,
    message_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media: Option<JsonMedia<'a>>,
}

#[derive(Serialize)]
struct JsonMedia<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    url: Option<&'a str>,
}

fn render_json(thread: &Thread, messages: &[Message], viewer: Viewer<'_>) -> Result<String, CoreError> {
    let senders = Senders::new(thread, viewer);
    let doc = JsonExport {
        conversation_info: ConversationInfo {
            participants: thread.usernames(),
            thread_id: &thread.id,
            export_time: Utc::now().to_rfc3339(),
            message_count: messages.len(),
        },
        messages: messages
            .iter()
            .map(|msg| JsonMessage {
                timestamp: msg.timestamp.to_rfc3339(),
                sender: senders.name(msg.user_id),
                sender_id: msg.user_id,
                text: msg.text.as_deref(),
                message_id: &msg.id,
                media: msg.media.as_ref().map(|media| JsonMedia {
                    kind: match media.kind {
                        MediaKind::Image => "image",
                        MediaKind::Video => "video",
                    },
                    url: media.url.as_deref(),
                }),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// RFC 4180 field: quoted only when it holds a comma, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn push_csv_row<I, S>(out: &mut String, fields: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let row: Vec<String> = fields.into_iter().map(|f| csv_field(f.as_ref())).collect();
    out.push_str(&row.join(","));
    out.push_str("\r\n");
}

fn render_csv(thread: &Thread, messages: &[Message], viewer: Viewer<'_>) -> String {
    let senders = Senders::new(thread, viewer);
    let mut out = String::new();
    push_csv_row(&mut out, CSV_HEADER);
    for msg in messages {
        let (media_type, media_url) = match &msg.media {
            Some(media) => (media.kind.label(), media.url.clone().unwrap_or_default()),
            None => ("", String::new()),
        };
        push_csv_row(
            &mut out,
            [
                msg.timestamp.to_rfc3339(),
                msg.timestamp.format("%Y-%m-%d").to_string(),
                msg.timestamp.format("%H:%M:%S").to_string(),
                senders.name(msg.user_id),
                msg.user_id.to_string(),
                msg.text
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .unwrap_or(NO_TEXT)
                    .to_string(),
                media_type.to_string(),
                media_url,
            ],
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Media, User};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("ts")
    }

    fn thread() -> Thread {
        Thread {
            id: "340282366841710300949128".to_string(),
            title: None,
            users: vec![User {
                pk: 2,
                username: "ali/ce".to_string(),
                full_name: None,
            }],
            messages: vec![],
            last_activity_at: None,
        }
    }

    fn message(id: &str, user_id: u64, secs: i64, text: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            user_id,
            text: text.map(str::to_string),
            timestamp: ts(secs),
            item_type: Some("text".to_string()),
            media: None,
        }
    }

    #[test]
    fn sanitize_filename_replaces_reserved() {
        assert_eq!(sanitize_filename(r#"user/with\bad:chars|t*?"<>"#), "user_with_bad_chars_t_____");
        assert_eq!(sanitize_filename("plain.name"), "plain.name");
    }

    #[test]
    fn csv_field_quotes_only_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn txt_groups_by_day_and_names_senders() {
        // 2024-01-01 10:00:00 and 2024-01-02 09:30:00 UTC
        let mut photo = message("3", 1, 1_704_187_800, None);
        photo.media = Some(Media {
            kind: MediaKind::Image,
            url: Some("https://cdn/p.jpg".to_string()),
        });
        let mut msgs = vec![photo, message("1", 2, 1_704_103_200, Some("hello")), message("2", 9, 1_704_103_260, Some("hey"))];
        sort_by_timestamp(&mut msgs);
        let out = render_txt(&thread(), &msgs, Viewer::new(1, "me"));

        assert!(out.starts_with("Conversation with ali/ce\n"));
        assert!(out.contains(&"=".repeat(70)));
        assert!(out.contains("Monday, January 01, 2024"));
        assert!(out.contains("Tuesday, January 02, 2024"));
        assert!(out.contains("10:00:00 - ali/ce: hello\n"));
        assert!(out.contains("10:01:00 - Unknown (9): hey\n"));
        assert!(out.contains("09:30:00 - me: [No text content]\n  [Image: https://cdn/p.jpg]\n"));
        let first_day = out.find("January 01").expect("day 1");
        let second_day = out.find("January 02").expect("day 2");
        assert!(first_day < second_day);
    }

    #[test]
    fn json_document_shape() {
        let msgs = vec![message("1", 2, 1_704_103_200, Some("hello"))];
        let raw = render_json(&thread(), &msgs, Viewer::default()).expect("json");
        let doc: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(doc["conversation_info"]["participants"][0], "ali/ce");
        assert_eq!(doc["conversation_info"]["message_count"], 1);
        assert_eq!(doc["messages"][0]["sender"], "ali/ce");
        assert_eq!(doc["messages"][0]["message_id"], "1");
        assert_eq!(doc["messages"][0]["timestamp"], "2024-01-01T10:00:00+00:00");
        assert!(doc["messages"][0].get("media").is_none());
    }

    #[test]
    fn csv_has_header_and_rows() {
        let msgs = vec![message("1", 2, 1_704_103_200, Some("hi, there"))];
        let out = render_csv(&thread(), &msgs, Viewer::default());
        let lines: Vec<&str> = out.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines[0], "Timestamp,Date,Time,Sender,Sender_ID,Message,Media_Type,Media_URL");
        assert_eq!(
            lines[1],
            "2024-01-01T10:00:00+00:00,2024-01-01,10:00:00,ali/ce,2,\"hi, there\",,"
        );
    }
}
