//! Synthetic backup tree for demos and fixtures: a message store, an address
//! book and attachment files laid out the way a device backup stores them.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};

use crate::backup_paths::{address_book_path, resolve_attachment_path, sms_db_path, MEDIA_DOMAIN};
use crate::error::CoreError;
use crate::extractor::rich_text::encode_text;
use crate::timestamp::datetime_to_apple_ns;

pub const MESSAGE_STORE_SCHEMA: &str = "
    CREATE TABLE handle (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, id TEXT NOT NULL, service TEXT);
    CREATE TABLE chat (
      ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
      guid TEXT UNIQUE NOT NULL,
      chat_identifier TEXT,
      service_name TEXT,
      display_name TEXT
    );
    CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER, UNIQUE(chat_id, handle_id));
    CREATE TABLE message (
      ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
      guid TEXT UNIQUE NOT NULL,
      text TEXT,
      attributedBody BLOB,
      handle_id INTEGER DEFAULT 0,
      is_from_me INTEGER DEFAULT 0,
      date INTEGER,
      date_read INTEGER,
      date_delivered INTEGER,
      service TEXT,
      audio_transcription TEXT
    );
    CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER, PRIMARY KEY (chat_id, message_id));
    CREATE TABLE attachment (
      ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
      guid TEXT UNIQUE NOT NULL,
      filename TEXT,
      mime_type TEXT,
      transfer_name TEXT,
      total_bytes INTEGER DEFAULT 0
    );
    CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER, UNIQUE(message_id, attachment_id));
";

pub const ADDRESS_BOOK_SCHEMA: &str = "
    CREATE TABLE ABPerson (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, First TEXT, Last TEXT, Organization TEXT);
    CREATE TABLE ABMultiValue (UID INTEGER PRIMARY KEY, record_id INTEGER, property INTEGER, label INTEGER, value TEXT);
";

pub const DEMO_PARTNER_HANDLE: &str = "+15550001111";
pub const DEMO_ATTACHMENT_PATH: &str = "~/Library/SMS/Attachments/0a/00/IMG_0001.JPG";

/// Creates an empty message store at the hashed location inside `backup_root`.
pub fn create_message_store(backup_root: &Path) -> Result<Connection, CoreError> {
    let path = sms_db_path(backup_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&path)?;
    conn.execute_batch(MESSAGE_STORE_SCHEMA)?;
    Ok(conn)
}

pub fn create_address_book(backup_root: &Path) -> Result<Connection, CoreError> {
    let path = address_book_path(backup_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&path)?;
    conn.execute_batch(ADDRESS_BOOK_SCHEMA)?;
    Ok(conn)
}

/// Writes `bytes` where the backup keeps the media file referenced by `device_path`.
pub fn write_media_file(backup_root: &Path, device_path: &str, bytes: &[u8]) -> Result<(), CoreError> {
    let target = resolve_attachment_path(backup_root, MEDIA_DOMAIN, device_path)
        .ok_or_else(|| CoreError::InvalidArgument(format!("unresolvable media path {}", device_path)))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, bytes)?;
    Ok(())
}

pub fn seed_demo_backup(backup_root: &Path, primary_count: i64, secondary_threads: i64) -> Result<(), CoreError> {
    fs::create_dir_all(backup_root)?;
    let conn = create_message_store(backup_root)?;
    conn.execute_batch("BEGIN;")?;
    let result = (|| -> Result<(), CoreError> {
        conn.execute(
            "INSERT INTO handle (ROWID, id, service) VALUES (1, ?1, 'iMessage');",
            params![DEMO_PARTNER_HANDLE],
        )?;
        conn.execute("INSERT INTO handle (ROWID, id, service) VALUES (2, 'friend@example.com', 'iMessage');", [])?;
        conn.execute("INSERT INTO handle (ROWID, id, service) VALUES (3, '+15550002222', 'SMS');", [])?;

        conn.execute(
            "INSERT INTO chat (ROWID, guid, chat_identifier, service_name, display_name) VALUES (1, ?1, ?2, 'iMessage', '');",
            params![format!("iMessage;-;{}", DEMO_PARTNER_HANDLE), DEMO_PARTNER_HANDLE],
        )?;
        conn.execute("INSERT INTO chat_handle_join (chat_id, handle_id) VALUES (1, 1);", [])?;

        let base_ns = datetime_to_apple_ns(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).single().unwrap_or_default());
        let minute_ns: i64 = 60 * 1_000_000_000;
        let mut msg_stmt = conn.prepare(
            "INSERT INTO message \
             (guid, text, attributedBody, handle_id, is_from_me, date, date_read, date_delivered, service) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
        )?;
        let mut join_stmt = conn.prepare("INSERT INTO chat_message_join (chat_id, message_id) VALUES (?1, ?2);")?;

        for idx in 0..primary_count {
            let guid = format!("DEMO-{:08X}", idx + 1);
            let date = base_ns + idx * minute_ns;
            let from_me = idx % 2 == 0;
            let body = if from_me {
                format!("Demo message {}", idx + 1)
            } else {
                format!("Reply {}", idx + 1)
            };
            // every fifth message only survives in the archived rich text column
            let (text, rich) = if (idx + 1) % 5 == 0 {
                (None, Some(encode_text(&body)))
            } else {
                (Some(body), None)
            };
            msg_stmt.execute(params![
                guid,
                text,
                rich,
                if from_me { 0 } else { 1 },
                from_me as i64,
                date,
                if from_me { 0 } else { date + minute_ns },
                date + 1_000_000_000,
                "iMessage",
            ])?;
            let message_id = conn.last_insert_rowid();
            join_stmt.execute(params![1, message_id])?;
            if idx == 2 {
                conn.execute(
                    "INSERT INTO attachment (guid, filename, mime_type, transfer_name, total_bytes) \
                     VALUES ('DEMO-ATT-1', ?1, 'image/jpeg', 'IMG_0001.JPG', 11);",
                    params![DEMO_ATTACHMENT_PATH],
                )?;
                let attachment_id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (?1, ?2);",
                    params![message_id, attachment_id],
                )?;
            }
        }

        for idx in 0..secondary_threads {
            let chat_id = idx + 2;
            let identifier = format!("chat{}", 100_000 + idx);
            conn.execute(
                "INSERT INTO chat (ROWID, guid, chat_identifier, service_name, display_name) VALUES (?1, ?2, ?3, 'iMessage', ?4);",
                params![chat_id, format!("iMessage;+;{}", identifier), identifier, format!("Group {}", idx + 1)],
            )?;
            conn.execute("INSERT INTO chat_handle_join (chat_id, handle_id) VALUES (?1, 2);", params![chat_id])?;
            conn.execute("INSERT INTO chat_handle_join (chat_id, handle_id) VALUES (?1, 3);", params![chat_id])?;
            msg_stmt.execute(params![
                format!("DEMO-GROUP-{}", idx + 1),
                format!("Short thread {}", idx + 1),
                Option::<Vec<u8>>::None,
                2,
                0,
                base_ns - (idx + 1) * minute_ns,
                0,
                0,
                "iMessage",
            ])?;
            join_stmt.execute(params![chat_id, conn.last_insert_rowid()])?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => conn.execute_batch("COMMIT;")?,
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(err);
        }
    }

    if primary_count > 2 {
        write_media_file(backup_root, DEMO_ATTACHMENT_PATH, b"demo jpeg!!")?;
    }

    let book = create_address_book(backup_root)?;
    book.execute_batch(
        "INSERT INTO ABPerson (ROWID, First, Last, Organization) VALUES (1, 'Pat', 'Partner', NULL);
         INSERT INTO ABPerson (ROWID, First, Last, Organization) VALUES (2, 'Fran', NULL, 'Friends Inc');
         INSERT INTO ABMultiValue (UID, record_id, property, label, value) VALUES (1, 1, 3, 1, '+1 (555) 000-1111');
         INSERT INTO ABMultiValue (UID, record_id, property, label, value) VALUES (2, 2, 4, 1, 'Friend@Example.com');",
    )?;
    Ok(())
}
