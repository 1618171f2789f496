use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CoreError;

/// Optional columns differ between OS versions of the message store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SchemaProbe {
    pub transcript: Option<String>,
    pub attributed_body: Option<String>,
    pub date_read: Option<String>,
    pub date_delivered: Option<String>,
    pub chat_display_name: Option<String>,
    pub attachment_total_bytes: Option<String>,
    pub has_attachment_tables: bool,
}

impl SchemaProbe {
    pub(crate) fn run(conn: &Connection) -> Result<Self, CoreError> {
        for required in ["message", "chat", "chat_message_join", "handle", "chat_handle_join"] {
            if !table_exists(conn, required)? {
                return Err(CoreError::InvalidArgument(format!(
                    "message store missing {} table",
                    required
                )));
            }
        }
        let has_attachment_tables =
            table_exists(conn, "attachment")? && table_exists(conn, "message_attachment_join")?;
        let attachment_total_bytes = if has_attachment_tables {
            pick_column(conn, "attachment", &["total_bytes"])?
        } else {
            None
        };
        Ok(Self {
            transcript: pick_column(conn, "message", &["audio_transcription", "transcription"])?,
            attributed_body: pick_column(conn, "message", &["attributedBody"])?,
            date_read: pick_column(conn, "message", &["date_read"])?,
            date_delivered: pick_column(conn, "message", &["date_delivered"])?,
            chat_display_name: pick_column(conn, "chat", &["display_name"])?,
            attachment_total_bytes,
            has_attachment_tables,
        })
    }

    pub(crate) fn has_transcript(&self) -> bool {
        self.transcript.is_some()
    }
}

pub(crate) fn column_or_null(column: &Option<String>, prefix: &str) -> String {
    column
        .as_deref()
        .map(|col| format!("{prefix}.{col}"))
        .unwrap_or_else(|| "NULL".to_string())
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, CoreError> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1;",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, CoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn pick_column(conn: &Connection, table: &str, preferred: &[&str]) -> Result<Option<String>, CoreError> {
    for col in preferred {
        if column_exists(conn, table, col)? {
            return Ok(Some((*col).to_string()));
        }
    }
    Ok(None)
}
