pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_runs (
      id TEXT PRIMARY KEY,
      owner TEXT NOT NULL,
      source TEXT NOT NULL,
      started_at INTEGER NOT NULL,
      finished_at INTEGER,
      status TEXT NOT NULL,
      stats_json TEXT
    );

    CREATE TABLE IF NOT EXISTS messages (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      owner TEXT NOT NULL,
      external_id TEXT NOT NULL,
      conversation_id TEXT NOT NULL,
      conversation_name TEXT,
      is_group INTEGER NOT NULL DEFAULT 0,
      sender TEXT,
      sender_name TEXT,
      is_from_me INTEGER NOT NULL DEFAULT 0,
      channel TEXT NOT NULL,
      body TEXT,
      sent_at INTEGER,
      read_at INTEGER,
      delivered_at INTEGER,
      sort_ts INTEGER NOT NULL DEFAULT 0,
      imported_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_owner_external
      ON messages(owner, external_id);

    CREATE TABLE IF NOT EXISTS contacts (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      owner TEXT NOT NULL,
      source TEXT NOT NULL,
      external_record_id TEXT NOT NULL,
      name TEXT,
      company TEXT,
      phones_json TEXT NOT NULL DEFAULT '[]',
      emails_json TEXT NOT NULL DEFAULT '[]',
      updated_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_owner_source_record
      ON contacts(owner, source, external_record_id);

    CREATE TABLE IF NOT EXISTS attachments (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      owner TEXT NOT NULL,
      message_external_id TEXT NOT NULL,
      attachment_guid TEXT NOT NULL,
      sha256 TEXT NOT NULL,
      mime TEXT,
      size_bytes INTEGER,
      original_filename TEXT,
      transfer_name TEXT
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_owner_message_guid
      ON attachments(owner, message_external_id, attachment_guid);
    CREATE INDEX IF NOT EXISTS idx_attachments_sha256 ON attachments(sha256);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_sort
      ON messages(owner, conversation_id, sort_ts ASC, id ASC);
    "#,
];
