use std::collections::HashSet;

use rusqlite::{params, Connection};

use crate::error::CoreError;
use crate::models::{ArchiveStats, Contact, StoredMessage};

pub fn existing_external_ids(conn: &Connection, owner: &str) -> Result<HashSet<String>, CoreError> {
    let mut stmt = conn.prepare("SELECT external_id FROM messages WHERE owner = ?1;")?;
    let rows = stmt.query_map(params![owner], |row| row.get::<_, String>(0))?;
    let mut ids = HashSet::new();
    for row in rows {
        ids.insert(row?);
    }
    Ok(ids)
}

pub fn archive_stats(conn: &Connection, owner: &str) -> Result<ArchiveStats, CoreError> {
    let count = |sql: &str| -> Result<i64, CoreError> {
        Ok(conn.query_row(sql, params![owner], |row| row.get(0))?)
    };
    Ok(ArchiveStats {
        messages: count("SELECT COUNT(1) FROM messages WHERE owner = ?1;")?,
        conversations: count("SELECT COUNT(DISTINCT conversation_id) FROM messages WHERE owner = ?1;")?,
        contacts: count("SELECT COUNT(1) FROM contacts WHERE owner = ?1;")?,
        attachments: count("SELECT COUNT(1) FROM attachments WHERE owner = ?1;")?,
    })
}

pub fn list_stored_messages(
    conn: &Connection,
    owner: &str,
    conversation_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<StoredMessage>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT external_id, conversation_id, sender, sender_name, is_from_me, channel, body, sent_at \
         FROM messages \
         WHERE owner = ?1 AND conversation_id = ?2 \
         ORDER BY sort_ts ASC, id ASC \
         LIMIT ?3 OFFSET ?4;",
    )?;
    let rows = stmt.query_map(params![owner, conversation_id, limit, offset], |row| {
        Ok(StoredMessage {
            external_id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender: row.get(2)?,
            sender_name: row.get(3)?,
            is_from_me: row.get::<_, i64>(4)? != 0,
            channel: row.get(5)?,
            body: row.get(6)?,
            sent_at: row.get(7)?,
        })
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

pub fn list_stored_contacts(conn: &Connection, owner: &str, source: &str) -> Result<Vec<Contact>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT external_record_id, name, company, phones_json, emails_json \
         FROM contacts \
         WHERE owner = ?1 AND source = ?2 \
         ORDER BY external_record_id ASC;",
    )?;
    let rows = stmt.query_map(params![owner, source], |row| {
        let phones: String = row.get(3)?;
        let emails: String = row.get(4)?;
        Ok(Contact {
            record_id: row.get(0)?,
            display_name: row.get(1)?,
            organization: row.get(2)?,
            phones: serde_json::from_str(&phones).unwrap_or_default(),
            emails: serde_json::from_str(&emails).unwrap_or_default(),
        })
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

pub fn latest_run_status(conn: &Connection, owner: &str) -> Result<Option<String>, CoreError> {
    use rusqlite::OptionalExtension;
    let status = conn
        .query_row(
            "SELECT status FROM sync_runs WHERE owner = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1;",
            params![owner],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status)
}
