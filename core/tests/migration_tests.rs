use handset_sync_core::db::apply_migrations;
use handset_sync_core::open_archive;
use rusqlite::{params, Connection};
use tempfile::tempdir;

fn index_count(conn: &Connection, name: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='index' AND name=?1;",
        [name],
        |row| row.get(0),
    )
    .expect("index query")
}

#[test]
fn unique_indexes_exist() {
    let conn = Connection::open_in_memory().expect("memory db");
    apply_migrations(&conn).expect("migrate");
    for name in [
        "idx_messages_owner_external",
        "idx_contacts_owner_source_record",
        "idx_attachments_owner_message_guid",
        "idx_messages_conversation_sort",
    ] {
        assert_eq!(index_count(&conn, name), 1, "{name}");
    }
}

#[test]
fn message_external_id_is_unique_per_owner() {
    let conn = Connection::open_in_memory().expect("memory db");
    apply_migrations(&conn).expect("migrate");
    let insert = |owner: &str| {
        conn.execute(
            "INSERT OR IGNORE INTO messages (owner, external_id, conversation_id, channel, imported_at) \
             VALUES (?1, 'GUID-1', 'chat', 'imessage', 0);",
            params![owner],
        )
        .expect("insert")
    };
    assert_eq!(insert("alice"), 1);
    assert_eq!(insert("alice"), 0);
    assert_eq!(insert("bob"), 1);
}

#[test]
fn reopening_keeps_version_and_fails_stale_runs() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("archive.sqlite");
    {
        let archive = open_archive(&path).expect("open");
        archive
            .conn
            .execute(
                "INSERT INTO sync_runs (id, owner, source, started_at, status) VALUES ('run-1', 'alice', 'phone', 1, 'running');",
                [],
            )
            .expect("run");
    }
    let archive = open_archive(&path).expect("reopen");
    let version: i64 = archive
        .conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .expect("version");
    assert_eq!(version, 2);
    let (status, stats): (String, String) = archive
        .conn
        .query_row(
            "SELECT status, stats_json FROM sync_runs WHERE id = 'run-1';",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("run row");
    assert_eq!(status, "failed");
    assert!(stats.contains("interrupted"));
}
