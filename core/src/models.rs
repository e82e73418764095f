use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated account identity, produced by login or session restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: u64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub pk: u64,
    pub username: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Image => "Image",
            MediaKind::Video => "Video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_id: u64,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub item_type: Option<String>,
    pub media: Option<Media>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub title: Option<String>,
    pub users: Vec<User>,
    /// Most recent messages first, as delivered by the inbox.
    pub messages: Vec<Message>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

const PREVIEW_LIMIT: usize = 50;

impl Thread {
    pub fn usernames(&self) -> Vec<&str> {
        self.users.iter().map(|u| u.username.as_str()).collect()
    }

    pub fn primary_username(&self) -> &str {
        self.users
            .first()
            .map(|u| u.username.as_str())
            .unwrap_or("unknown")
    }

    /// One-line summary of the latest message for conversation lists.
    pub fn preview_text(&self) -> String {
        let preview = match self.messages.first() {
            Some(msg) => match (&msg.text, &msg.media) {
                (Some(text), _) if !text.is_empty() => text.clone(),
                (_, Some(_)) => "[Media message]".to_string(),
                _ => "[No messages]".to_string(),
            },
            None => "[No messages]".to_string(),
        };
        if preview.chars().count() > PREVIEW_LIMIT {
            let head: String = preview.chars().take(PREVIEW_LIMIT - 3).collect();
            format!("{head}...")
        } else {
            preview
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: Option<&str>, media: Option<Media>) -> Message {
        Message {
            id: "m1".to_string(),
            user_id: 1,
            text: text.map(str::to_string),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).expect("ts"),
            item_type: None,
            media,
        }
    }

    fn thread(messages: Vec<Message>) -> Thread {
        Thread {
            id: "t1".to_string(),
            title: None,
            users: vec![],
            messages,
            last_activity_at: None,
        }
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "x".repeat(80);
        let preview = thread(vec![message(Some(&long), None)]).preview_text();
        assert_eq!(preview.chars().count(), 50);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn preview_labels_media_and_empty_threads() {
        let media = Media {
            kind: MediaKind::Image,
            url: None,
        };
        assert_eq!(thread(vec![message(None, Some(media))]).preview_text(), "[Media message]");
        assert_eq!(thread(vec![]).preview_text(), "[No messages]");
        assert_eq!(thread(vec![]).primary_username(), "unknown");
    }
}
