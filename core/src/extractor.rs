//! Read-only access to the message store inside a device backup.
//!
//! Read methods only fail when the extractor has not been opened. Any other
//! problem is logged and degrades to an empty result, so one malformed row or
//! chat never aborts a whole-backup scan.

use std::ops::ControlFlow;
use std::path::Path;
use std::thread;

use rusqlite::{params, Connection, OpenFlags, Row};

use crate::config::{DEFAULT_CONVERSATION_YIELD_EVERY, DEFAULT_MESSAGE_YIELD_EVERY};
use crate::error::CoreError;
use crate::models::{Attachment, Conversation, Message, MessageChannel};
use crate::timestamp::apple_ns_to_datetime;

#[path = "extractor/rich_text.rs"]
pub mod rich_text;
#[path = "extractor/schema.rs"]
mod schema;

use schema::{column_or_null, SchemaProbe};

/// Synthetic chat identifiers for group threads start with this prefix.
pub const GROUP_CHAT_PREFIX: &str = "chat";

/// Progress callback for the yielding traversals: `(processed, total)`.
/// Returning `ControlFlow::Break` stops the traversal early.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, usize) -> ControlFlow<()>;

pub struct BackupExtractor {
    conn: Option<Connection>,
    probe: SchemaProbe,
    conversation_yield_every: usize,
    message_yield_every: usize,
}

impl Default for BackupExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupExtractor {
    pub fn new() -> Self {
        Self::with_yield_intervals(DEFAULT_CONVERSATION_YIELD_EVERY, DEFAULT_MESSAGE_YIELD_EVERY)
    }

    pub fn with_yield_intervals(conversation_yield_every: usize, message_yield_every: usize) -> Self {
        Self {
            conn: None,
            probe: SchemaProbe::default(),
            conversation_yield_every: conversation_yield_every.max(1),
            message_yield_every: message_yield_every.max(1),
        }
    }

    pub fn open(&mut self, path: &Path) -> Result<(), CoreError> {
        if !path.exists() {
            return Err(CoreError::InvalidArgument(format!(
                "message store not found: {}",
                path.display()
            )));
        }
        self.close();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let probe = SchemaProbe::run(&conn)?;
        log::debug!(
            "opened message store (transcript column: {}, rich text column: {})",
            probe.has_transcript(),
            probe.attributed_body.is_some()
        );
        self.conn = Some(conn);
        self.probe = probe;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                log::debug!("closing message store failed: {}", err);
            }
        }
        self.probe = SchemaProbe::default();
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> Result<&Connection, CoreError> {
        self.conn.as_ref().ok_or(CoreError::NotOpen)
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>, CoreError> {
        let conn = self.conn()?;
        Ok(degrade("list_conversations", self.collect_conversations(conn, None)))
    }

    pub fn list_conversations_incremental(&self, on_progress: ProgressFn<'_>) -> Result<Vec<Conversation>, CoreError> {
        let conn = self.conn()?;
        Ok(degrade(
            "list_conversations_incremental",
            self.collect_conversations(conn, Some(on_progress)),
        ))
    }

    pub fn list_messages(&self, chat_id: i64, limit: Option<i64>, offset: Option<i64>) -> Result<Vec<Message>, CoreError> {
        let conn = self.conn()?;
        Ok(degrade(
            "list_messages",
            self.collect_messages(conn, chat_id, limit, offset, None),
        ))
    }

    pub fn list_messages_incremental(&self, chat_id: i64, on_progress: ProgressFn<'_>) -> Result<Vec<Message>, CoreError> {
        let conn = self.conn()?;
        Ok(degrade(
            "list_messages_incremental",
            self.collect_messages(conn, chat_id, None, None, Some(on_progress)),
        ))
    }

    pub fn get_attachments(&self, message_id: i64) -> Result<Vec<Attachment>, CoreError> {
        let conn = self.conn()?;
        Ok(degrade("get_attachments", self.query_attachments(conn, message_id)))
    }

    pub fn search_messages(&self, query: &str, limit: Option<i64>) -> Result<Vec<Message>, CoreError> {
        let conn = self.conn()?;
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        Ok(degrade("search_messages", self.query_search(conn, query, limit)))
    }

    pub fn get_message_count(&self, chat_id: i64) -> Result<i64, CoreError> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM chat_message_join WHERE chat_id = ?1;",
            params![chat_id],
            |row| row.get::<_, i64>(0),
        );
        Ok(degrade("get_message_count", count.map_err(CoreError::from)))
    }

    fn collect_conversations(
        &self,
        conn: &Connection,
        mut on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<Conversation>, CoreError> {
        let mut chat_stmt = conn.prepare(&format!(
            "SELECT c.ROWID, c.guid, c.chat_identifier, c.service_name, {display} FROM chat c;",
            display = column_or_null(&self.probe.chat_display_name, "c"),
        ))?;
        let chats: Vec<ChatRow> = chat_stmt
            .query_map([], |row| {
                Ok(ChatRow {
                    id: row.get(0)?,
                    guid: row.get(1)?,
                    identifier: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    service: row.get(3)?,
                    display_name: row.get(4)?,
                })
            })?
            .filter_map(|row| match row {
                Ok(row) => Some(row),
                Err(err) => {
                    log::debug!("skipping unreadable chat row: {}", err);
                    None
                }
            })
            .collect();

        let mut activity_stmt = conn.prepare(
            "SELECT MAX(m.date), COUNT(m.ROWID) \
             FROM chat_message_join cmj \
             JOIN message m ON m.ROWID = cmj.message_id \
             WHERE cmj.chat_id = ?1;",
        )?;
        let mut participant_stmt = conn.prepare(
            "SELECT h.id \
             FROM chat_handle_join chj \
             JOIN handle h ON h.ROWID = chj.handle_id \
             WHERE chj.chat_id = ?1 \
             ORDER BY h.ROWID ASC;",
        )?;

        let total = chats.len();
        let mut ranked: Vec<(i64, Conversation)> = Vec::with_capacity(total);
        let mut stopped = false;
        for (idx, chat) in chats.into_iter().enumerate() {
            let processed = idx + 1;
            match load_conversation(&mut activity_stmt, &mut participant_stmt, chat) {
                Ok(Some(entry)) => ranked.push(entry),
                Ok(None) => {}
                Err(err) => log::warn!("skipping conversation after read failure: {}", err),
            }
            if processed % self.conversation_yield_every == 0 && processed < total {
                if let Some(cb) = on_progress.as_mut() {
                    if cb(processed, total).is_break() {
                        stopped = true;
                        break;
                    }
                    thread::yield_now();
                }
            }
        }
        if !stopped {
            if let Some(cb) = on_progress.as_mut() {
                let _ = cb(total, total);
            }
        }

        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.chat_id.cmp(&b.1.chat_id)));
        Ok(ranked.into_iter().map(|(_, conversation)| conversation).collect())
    }

    fn collect_messages(
        &self,
        conn: &Connection,
        chat_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
        mut on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<Message>, CoreError> {
        let reconstruct = on_progress.is_some();
        let total = if on_progress.is_some() {
            conn.query_row(
                "SELECT COUNT(1) FROM chat_message_join WHERE chat_id = ?1;",
                params![chat_id],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as usize
        } else {
            0
        };

        let sql = format!(
            "SELECT {columns} \
             FROM chat_message_join cmj \
             JOIN message m ON m.ROWID = cmj.message_id \
             LEFT JOIN handle h ON h.ROWID = m.handle_id \
             WHERE cmj.chat_id = ?1 \
             ORDER BY m.date ASC, m.ROWID ASC \
             LIMIT ?2 OFFSET ?3;",
            columns = self.message_columns(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![chat_id, limit.unwrap_or(-1), offset.unwrap_or(0).max(0)],
            read_message_row,
        )?;

        let mut messages = Vec::new();
        let mut stopped = false;
        for row in rows {
            let raw = match row {
                Ok(raw) => raw,
                Err(err) => {
                    log::debug!("skipping unreadable message row in chat {}: {}", chat_id, err);
                    continue;
                }
            };
            let mut message = raw.into_message(reconstruct);
            message.attachments = degrade("get_attachments", self.query_attachments(conn, message.id));
            messages.push(message);

            let processed = messages.len();
            if processed % self.message_yield_every == 0 {
                if let Some(cb) = on_progress.as_mut() {
                    if cb(processed, total).is_break() {
                        stopped = true;
                        break;
                    }
                    thread::yield_now();
                }
            }
        }
        if !stopped {
            if let Some(cb) = on_progress.as_mut() {
                let _ = cb(messages.len(), total.max(messages.len()));
            }
        }
        Ok(messages)
    }

    fn query_attachments(&self, conn: &Connection, message_id: i64) -> Result<Vec<Attachment>, CoreError> {
        if !self.probe.has_attachment_tables {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT a.ROWID, a.guid, a.filename, a.mime_type, a.transfer_name, {size} \
             FROM message_attachment_join maj \
             JOIN attachment a ON a.ROWID = maj.attachment_id \
             WHERE maj.message_id = ?1 \
             ORDER BY a.ROWID ASC;",
            size = column_or_null(&self.probe.attachment_total_bytes, "a"),
        ))?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                guid: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                filename: row.get(2)?,
                mime_type: row.get(3)?,
                transfer_name: row.get(4)?,
                total_bytes: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    fn query_search(&self, conn: &Connection, query: &str, limit: Option<i64>) -> Result<Vec<Message>, CoreError> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        let sql = format!(
            "SELECT {columns} \
             FROM message m \
             LEFT JOIN handle h ON h.ROWID = m.handle_id \
             WHERE lower(m.text) LIKE ?1 ESCAPE '\\' \
             ORDER BY m.date DESC, m.ROWID DESC \
             LIMIT ?2;",
            columns = self.message_columns(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, limit.unwrap_or(-1)], read_message_row)?;
        let mut hits = Vec::new();
        for raw in rows.filter_map(Result::ok) {
            let mut message = raw.into_message(false);
            message.attachments = degrade("get_attachments", self.query_attachments(conn, message.id));
            hits.push(message);
        }
        Ok(hits)
    }

    fn message_columns(&self) -> String {
        format!(
            "m.ROWID, m.guid, m.text, h.id, m.is_from_me, m.date, {read}, {delivered}, m.service, {body}, {transcript}",
            read = column_or_null(&self.probe.date_read, "m"),
            delivered = column_or_null(&self.probe.date_delivered, "m"),
            body = column_or_null(&self.probe.attributed_body, "m"),
            transcript = column_or_null(&self.probe.transcript, "m"),
        )
    }
}

impl Drop for BackupExtractor {
    fn drop(&mut self) {
        self.close();
    }
}

struct ChatRow {
    id: i64,
    guid: Option<String>,
    identifier: String,
    service: Option<String>,
    display_name: Option<String>,
}

fn load_conversation(
    activity_stmt: &mut rusqlite::Statement<'_>,
    participant_stmt: &mut rusqlite::Statement<'_>,
    chat: ChatRow,
) -> Result<Option<(i64, Conversation)>, CoreError> {
    let (last_date, message_count): (Option<i64>, i64) =
        activity_stmt.query_row(params![chat.id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    if message_count == 0 {
        return Ok(None);
    }
    let participants: Vec<String> = participant_stmt
        .query_map(params![chat.id], |row| row.get::<_, Option<String>>(0))?
        .filter_map(Result::ok)
        .flatten()
        .collect();
    let is_group = is_group_chat(participants.len(), &chat.identifier);
    let conversation = Conversation {
        chat_id: chat.id,
        guid: chat.guid,
        chat_identifier: chat.identifier,
        display_name: chat.display_name.filter(|name| !name.trim().is_empty()),
        service_name: chat.service,
        participants,
        is_group,
        last_message_at: apple_ns_to_datetime(last_date),
    };
    Ok(Some((last_date.unwrap_or(0), conversation)))
}

pub fn is_group_chat(participant_count: usize, chat_identifier: &str) -> bool {
    participant_count > 1 || (chat_identifier.starts_with(GROUP_CHAT_PREFIX) && !chat_identifier.contains('@'))
}

struct RawMessage {
    id: i64,
    guid: Option<String>,
    text: Option<String>,
    handle: Option<String>,
    is_from_me: bool,
    date: Option<i64>,
    date_read: Option<i64>,
    date_delivered: Option<i64>,
    service: Option<String>,
    attributed_body: Option<Vec<u8>>,
    transcript: Option<String>,
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        guid: row.get(1)?,
        text: row.get(2)?,
        handle: row.get(3)?,
        is_from_me: row.get::<_, Option<i64>>(4)?.unwrap_or(0) != 0,
        date: row.get(5)?,
        date_read: row.get(6)?,
        date_delivered: row.get(7)?,
        service: row.get(8)?,
        attributed_body: row.get(9)?,
        transcript: row.get(10)?,
    })
}

impl RawMessage {
    fn into_message(self, reconstruct: bool) -> Message {
        let blank = self.text.as_deref().map_or(true, |t| t.trim().is_empty());
        let text = match (blank, reconstruct, self.attributed_body.as_deref()) {
            (true, true, Some(blob)) => match rich_text::extract_text(blob) {
                Ok(text) if !text.trim().is_empty() => Some(text),
                Ok(_) => None,
                Err(err) => {
                    log::debug!("rich text fallback failed for message {}: {}", self.id, err);
                    None
                }
            },
            (true, _, _) => None,
            (false, _, _) => self.text,
        };
        Message {
            id: self.id,
            guid: self.guid.unwrap_or_default(),
            text,
            transcript: self.transcript.filter(|t| !t.trim().is_empty()),
            handle: self.handle,
            sender_name: None,
            is_from_me: self.is_from_me,
            sent_at: apple_ns_to_datetime(self.date),
            read_at: apple_ns_to_datetime(self.date_read),
            delivered_at: apple_ns_to_datetime(self.date_delivered),
            channel: MessageChannel::from_service(self.service.as_deref()),
            attachments: Vec::new(),
        }
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn degrade<T: Default>(op: &str, result: Result<T, CoreError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            log::warn!("{} failed, returning empty result: {}", op, err);
            T::default()
        }
    }
}
