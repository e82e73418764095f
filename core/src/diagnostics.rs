use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::CoreError;

const MAX_LOG_BYTES: u64 = 1_500_000;
pub const TRACE_LOG_NAME: &str = "instadm.log";
pub const JOURNAL_NAME: &str = "diagnostics.log";
const REDACTED: &str = "[redacted]";

#[derive(Debug, Serialize)]
pub struct LogEvent {
    pub ts: String,
    pub kind: String,
    pub message: String,
}

fn sanitize(input: &str) -> String {
    let mut out = input.to_string();
    // strip obvious paths
    for prefix in ["/Users/", "/home/", "/root/", "/var/", "/private/", "C:\\", "D:\\"] {
        if let Some(idx) = out.find(prefix) {
            out.replace_range(idx.., REDACTED);
            break;
        }
    }
    out.split_whitespace()
        .map(|token| {
            let lowered = token.to_ascii_lowercase();
            if let Some(idx) = lowered.find("password=") {
                return format!("{}{}", &token[..idx + "password=".len()], REDACTED);
            }
            // long digit runs: user ids, phone numbers, 2FA backup codes
            let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
            if digits >= 10 {
                REDACTED.to_string()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Appends one redacted JSON line to `<log_dir>/diagnostics.log`.
pub fn log_event(log_dir: &Path, kind: &str, message: &str) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(JOURNAL_NAME);
    trim_log(&path)?;
    let event = LogEvent {
        ts: Utc::now().to_rfc3339(),
        kind: kind.to_string(),
        message: sanitize(message),
    };
    let line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn trim_log(path: &PathBuf) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let meta = fs::metadata(path)?;
    if meta.len() <= MAX_LOG_BYTES {
        return Ok(());
    }
    let data = fs::read(path)?;
    let keep_from = data.len().saturating_sub((MAX_LOG_BYTES / 2) as usize);
    // resume on a line boundary so the journal stays valid JSON lines
    let keep_from = data[keep_from..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|nl| keep_from + nl + 1)
        .unwrap_or(keep_from);
    fs::write(path, &data[keep_from..])?;
    Ok(())
}

/// Installs the global subscriber: stderr plus `<log_dir>/instadm.log`.
/// `RUST_LOG` overrides the configured level. A second call is a no-op.
pub fn init_tracing(config: &AppConfig) -> Result<(), CoreError> {
    let log_dir = config.log_dir();
    fs::create_dir_all(&log_dir)?;
    let trace_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(TRACE_LOG_NAME))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("instadm_core={}", config.log_level.as_filter())));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(trace_file)),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_redacts_paths_and_digits() {
        let msg = "path /Users/derek/secret 1234567890123";
        let cleaned = sanitize(msg);
        assert!(cleaned.contains(REDACTED));
        assert!(!cleaned.contains("Users"));

        let cleaned = sanitize("user 17841400000000000 sent");
        assert_eq!(cleaned, "user [redacted] sent");
    }

    #[test]
    fn sanitize_redacts_passwords() {
        let cleaned = sanitize("login retry Password=hunter2 user=alice");
        assert!(!cleaned.contains("hunter2"));
        assert!(cleaned.contains("Password=[redacted]"));
        assert!(cleaned.contains("user=alice"));
    }

    #[test]
    fn log_event_writes_json_lines() {
        let dir = tempdir().expect("temp");
        let log_dir = dir.path();
        for _ in 0..10 {
            log_event(log_dir, "fetch", "hello 1234567890").expect("log");
        }
        let raw = fs::read_to_string(log_dir.join(JOURNAL_NAME)).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 10);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["kind"], "fetch");
        assert_eq!(first["message"], "hello [redacted]");
    }

    #[test]
    fn trim_keeps_tail_on_line_boundary() {
        let dir = tempdir().expect("temp");
        let path = dir.path().join(JOURNAL_NAME);
        let line = format!("{{\"pad\":\"{}\"}}\n", "x".repeat(1000));
        let body = line.repeat((MAX_LOG_BYTES as usize / line.len()) + 10);
        fs::write(&path, &body).expect("write");
        trim_log(&path).expect("trim");
        let trimmed = fs::read_to_string(&path).expect("read");
        assert!((trimmed.len() as u64) <= MAX_LOG_BYTES / 2);
        assert!(trimmed.starts_with("{\"pad\""));
    }

    #[test]
    fn init_tracing_creates_log_file() {
        let dir = tempdir().expect("temp");
        let config = AppConfig::with_config_dir(dir.path());
        init_tracing(&config).expect("init");
        init_tracing(&config).expect("second init is harmless");
        assert!(config.log_dir().join(TRACE_LOG_NAME).exists());
    }
}
