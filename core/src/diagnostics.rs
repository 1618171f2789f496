//! Append-only JSON-lines event log for support bundles. Messages are scrubbed
//! of filesystem paths, phone numbers and email handles before they are written.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

const LOG_FILE: &str = "sync-diagnostics.log";
const MAX_LOG_BYTES: u64 = 1_500_000;
const MIN_REDACTED_DIGITS: usize = 7;
const PATH_PREFIXES: [&str; 7] = ["/Users/", "/home/", "/var/", "/private/", "/tmp/", "C:\\", "D:\\"];

#[derive(Debug, Serialize)]
struct LogEvent<'a> {
    ts: String,
    kind: &'a str,
    message: String,
}

fn sanitize(input: &str) -> String {
    input
        .split_whitespace()
        .map(|token| {
            if PATH_PREFIXES.iter().any(|prefix| token.contains(prefix)) {
                "[path]"
            } else if token.contains('@') && token.contains('.') {
                "[email]"
            } else if token.chars().filter(|c| c.is_ascii_digit()).count() >= MIN_REDACTED_DIGITS {
                "[number]"
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn log_event(log_dir: &Path, kind: &str, message: &str) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(LOG_FILE);
    trim_log(&path)?;
    let event = LogEvent {
        ts: Utc::now().to_rfc3339(),
        kind,
        message: sanitize(message),
    };
    let line = serde_json::to_string(&event).map_err(io::Error::other)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Keeps the newest half once the file outgrows its cap, starting on a line boundary.
fn trim_log(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if len <= MAX_LOG_BYTES {
        return Ok(());
    }
    let data = fs::read(path)?;
    let cut = data.len().saturating_sub((MAX_LOG_BYTES / 2) as usize);
    let start = data[cut..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|idx| cut + idx + 1)
        .unwrap_or(data.len());
    fs::write(path, &data[start..])
}
