//! Bulk load of extracted records into the archive database.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::contacts::{normalize_email, normalize_phone};
use crate::db::ArchiveDb;
use crate::error::CoreError;
use crate::models::{
    Contact, ConversationBundle, EntityCounts, Message, PersistResult, PersistStatus, SyncResult,
};
use crate::query::existing_external_ids;

#[path = "loader/attachments.rs"]
mod attachments;

pub const MAX_GUID_LEN: usize = 128;

pub fn is_valid_guid(guid: &str) -> bool {
    !guid.is_empty()
        && guid.len() <= MAX_GUID_LEN
        && guid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | '/' | '+' | '@'))
}

pub struct PersistenceLoader {
    archive: ArchiveDb,
    attachments_dir: PathBuf,
    config: SyncConfig,
}

struct MessageRow<'a> {
    conversation_id: String,
    conversation_name: Option<String>,
    is_group: bool,
    message: &'a Message,
}

impl PersistenceLoader {
    pub fn new(archive: ArchiveDb, attachments_dir: impl Into<PathBuf>, config: SyncConfig) -> Self {
        Self {
            archive,
            attachments_dir: attachments_dir.into(),
            config,
        }
    }

    pub fn archive(&self) -> &ArchiveDb {
        &self.archive
    }

    pub fn attachments_dir(&self) -> &Path {
        &self.attachments_dir
    }

    pub fn into_archive(self) -> ArchiveDb {
        self.archive
    }

    pub fn load_messages<F>(
        &mut self,
        owner: &str,
        bundles: &[ConversationBundle],
        progress: F,
    ) -> Result<EntityCounts, CoreError>
    where
        F: Fn(&str),
    {
        let mut seen = existing_external_ids(&self.archive.conn, owner)?;
        let total: usize = bundles.iter().map(|bundle| bundle.messages.len()).sum();
        let batch_size = self.config.message_batch_size.max(1);
        let yield_every = self.config.yield_every_batches.max(1);
        progress("Storing messages...");

        let mut counts = EntityCounts::default();
        let mut batch: Vec<MessageRow<'_>> = Vec::with_capacity(batch_size);
        let mut batches = 0usize;
        for bundle in bundles {
            let conversation = &bundle.conversation;
            let conversation_id = conversation
                .guid
                .clone()
                .filter(|guid| !guid.is_empty())
                .unwrap_or_else(|| conversation.chat_identifier.clone());
            let conversation_name = conversation
                .display_name
                .clone()
                .or_else(|| (!conversation.participants.is_empty()).then(|| conversation.participants.join(", ")));
            for message in &bundle.messages {
                if !is_valid_guid(&message.guid) {
                    log::debug!("skipping message {} with invalid guid", message.id);
                    counts.record(PersistStatus::Skipped);
                    continue;
                }
                if !seen.insert(message.guid.clone()) {
                    counts.record(PersistStatus::Skipped);
                    continue;
                }
                batch.push(MessageRow {
                    conversation_id: conversation_id.clone(),
                    conversation_name: conversation_name.clone(),
                    is_group: conversation.is_group,
                    message,
                });
                if batch.len() >= batch_size {
                    insert_message_batch(&mut self.archive, owner, &batch, &mut counts)?;
                    batch.clear();
                    batches += 1;
                    if batches % yield_every == 0 {
                        progress(&format!("Storing messages... {}/{}", counts.total(), total));
                        thread::yield_now();
                    }
                }
            }
        }
        if !batch.is_empty() {
            insert_message_batch(&mut self.archive, owner, &batch, &mut counts)?;
        }
        progress(&format!(
            "Messages stored: {} new, {} skipped",
            counts.stored, counts.skipped
        ));
        Ok(counts)
    }

    pub fn load_contacts(&mut self, owner: &str, source: &str, contacts: &[Contact]) -> Result<EntityCounts, CoreError> {
        let mut counts = EntityCounts::default();
        let now = Utc::now().timestamp_millis();
        let tx = self.archive.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contacts (owner, source, external_record_id, name, company, phones_json, emails_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(owner, source, external_record_id) DO UPDATE SET \
                   name = excluded.name, \
                   company = excluded.company, \
                   phones_json = excluded.phones_json, \
                   emails_json = excluded.emails_json, \
                   updated_at = excluded.updated_at;",
            )?;
            for contact in contacts {
                let record_id = contact.record_id.trim();
                if record_id.is_empty() {
                    counts.record(PersistStatus::Skipped);
                    continue;
                }
                let normalized = normalize_contact(contact);
                stmt.execute(params![
                    owner,
                    source,
                    record_id,
                    normalized.display_name,
                    normalized.organization,
                    serde_json::to_string(&normalized.phones)?,
                    serde_json::to_string(&normalized.emails)?,
                    now,
                ])?;
                counts.record(PersistStatus::Exported);
            }
        }
        tx.commit()?;
        Ok(counts)
    }

    pub fn load_attachments<F>(
        &mut self,
        owner: &str,
        backup_root: &Path,
        bundles: &[ConversationBundle],
        progress: F,
    ) -> Result<EntityCounts, CoreError>
    where
        F: Fn(&str),
    {
        let tx = self.archive.conn.transaction()?;
        let counts = attachments::load_attachments(
            &tx,
            owner,
            backup_root,
            &self.attachments_dir,
            &self.config,
            bundles,
            &progress,
        )?;
        tx.commit()?;
        Ok(counts)
    }

    pub fn persist(&mut self, owner: &str, source: &str, result: &SyncResult, backup_root: &Path) -> PersistResult {
        self.persist_with_progress(owner, source, result, backup_root, |_| {})
    }

    /// Runs the contact, message and attachment loads for one sync result and
    /// records the run in `sync_runs`. Failures are reported in the returned
    /// value with zeroed counts.
    pub fn persist_with_progress<F>(
        &mut self,
        owner: &str,
        source: &str,
        result: &SyncResult,
        backup_root: &Path,
        progress: F,
    ) -> PersistResult
    where
        F: Fn(&str),
    {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        if let Err(err) = self.archive.conn.execute(
            "INSERT INTO sync_runs (id, owner, source, started_at, finished_at, status, stats_json) \
             VALUES (?1, ?2, ?3, ?4, NULL, 'running', NULL);",
            params![run_id, owner, source, Utc::now().timestamp_millis()],
        ) {
            return failed_persist(CoreError::from(err), started);
        }

        match self.persist_inner(owner, source, result, backup_root, &progress) {
            Ok((messages, contacts, attachments)) => {
                let stats = serde_json::json!({
                    "messages": messages,
                    "contacts": contacts,
                    "attachments": attachments,
                })
                .to_string();
                self.finish_run(&run_id, "success", &stats);
                log::info!(
                    "persisted sync for {}: {} messages, {} contacts, {} attachments stored",
                    source,
                    messages.stored,
                    contacts.stored,
                    attachments.stored
                );
                PersistResult {
                    success: true,
                    messages,
                    contacts,
                    attachments,
                    duration: started.elapsed(),
                    error: None,
                }
            }
            Err(err) => {
                let msg = err.to_string();
                let stats = format!(
                    r#"{{"error":{}}}"#,
                    serde_json::to_string(&msg).unwrap_or_else(|_| "null".to_string())
                );
                self.finish_run(&run_id, "failed", &stats);
                log::warn!("persist failed: {}", msg);
                failed_persist(err, started)
            }
        }
    }

    fn persist_inner<F>(
        &mut self,
        owner: &str,
        source: &str,
        result: &SyncResult,
        backup_root: &Path,
        progress: &F,
    ) -> Result<(EntityCounts, EntityCounts, EntityCounts), CoreError>
    where
        F: Fn(&str),
    {
        if !result.success {
            return Err(CoreError::InvalidArgument(
                result.error.clone().unwrap_or_else(|| "sync did not succeed".to_string()),
            ));
        }
        if result.skipped {
            progress("Backup unchanged, nothing to store");
            return Ok(Default::default());
        }
        let data = result
            .data
            .as_ref()
            .ok_or_else(|| CoreError::InvalidArgument("sync result carries no data".to_string()))?;
        progress("Storing contacts...");
        let contacts = self.load_contacts(owner, source, &data.contacts)?;
        let messages = self.load_messages(owner, &data.conversations, progress)?;
        let attachments = self.load_attachments(owner, backup_root, &data.conversations, progress)?;
        Ok((messages, contacts, attachments))
    }

    fn finish_run(&self, run_id: &str, status: &str, stats_json: &str) {
        if let Err(err) = self.archive.conn.execute(
            "UPDATE sync_runs SET status = ?2, finished_at = ?3, stats_json = ?4 WHERE id = ?1;",
            params![run_id, status, Utc::now().timestamp_millis(), stats_json],
        ) {
            log::warn!("could not record sync run {}: {}", run_id, err);
        }
    }
}

fn failed_persist(err: CoreError, started: Instant) -> PersistResult {
    PersistResult {
        success: false,
        duration: started.elapsed(),
        error: Some(err.to_string()),
        ..PersistResult::default()
    }
}

fn normalize_contact(contact: &Contact) -> Contact {
    let mut phones: Vec<String> = Vec::new();
    for phone in contact.phones.iter().filter_map(|p| normalize_phone(p)) {
        if !phones.contains(&phone) {
            phones.push(phone);
        }
    }
    let mut emails: Vec<String> = Vec::new();
    for email in contact.emails.iter().filter_map(|e| normalize_email(e)) {
        if !emails.contains(&email) {
            emails.push(email);
        }
    }
    Contact {
        record_id: contact.record_id.trim().to_string(),
        display_name: contact.display_name.as_ref().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        organization: contact.organization.as_ref().map(|o| o.trim().to_string()).filter(|o| !o.is_empty()),
        phones,
        emails,
    }
}

/// One transaction per batch. A row that hits the uniqueness constraint is
/// counted as skipped and the batch carries on.
fn insert_message_batch(
    archive: &mut ArchiveDb,
    owner: &str,
    batch: &[MessageRow<'_>],
    counts: &mut EntityCounts,
) -> Result<(), CoreError> {
    let imported_at = Utc::now().timestamp_millis();
    let tx = archive.conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO messages \
             (owner, external_id, conversation_id, conversation_name, is_group, sender, sender_name, is_from_me, \
              channel, body, sent_at, read_at, delivered_at, sort_ts, imported_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15);",
        )?;
        for row in batch {
            let message = row.message;
            let sent_at = message.sent_at.map(|ts| ts.timestamp_millis());
            let body = message.text.clone().or_else(|| message.transcript.clone());
            let changes = stmt.execute(params![
                owner,
                message.guid,
                row.conversation_id,
                row.conversation_name,
                row.is_group as i64,
                message.handle,
                message.sender_name,
                message.is_from_me as i64,
                message.channel.as_str(),
                body,
                sent_at,
                message.read_at.map(|ts| ts.timestamp_millis()),
                message.delivered_at.map(|ts| ts.timestamp_millis()),
                sent_at.unwrap_or(0),
                imported_at,
            ])?;
            counts.record(if changes == 0 {
                PersistStatus::Skipped
            } else {
                PersistStatus::Exported
            });
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_validation() {
        assert!(is_valid_guid("p:0/5F2A-11EE-8D0B@host.example+1"));
        assert!(!is_valid_guid(""));
        assert!(!is_valid_guid("has space"));
        assert!(!is_valid_guid("semi;colon"));
        assert!(!is_valid_guid(&"a".repeat(MAX_GUID_LEN + 1)));
        assert!(is_valid_guid(&"a".repeat(MAX_GUID_LEN)));
    }

    #[test]
    fn contact_normalization_dedups_values() {
        let contact = Contact {
            record_id: " 12 ".to_string(),
            display_name: Some("  ".to_string()),
            organization: Some(" Acme ".to_string()),
            phones: vec!["555-000-1111".to_string(), "(555) 000 1111".to_string()],
            emails: vec!["A@B.com".to_string(), "a@b.com ".to_string(), "nope".to_string()],
        };
        let normalized = normalize_contact(&contact);
        assert_eq!(normalized.record_id, "12");
        assert_eq!(normalized.display_name, None);
        assert_eq!(normalized.organization.as_deref(), Some("Acme"));
        assert_eq!(normalized.phones, vec!["5550001111".to_string()]);
        assert_eq!(normalized.emails, vec!["a@b.com".to_string()]);
    }
}
