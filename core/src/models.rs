use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub product_version: Option<String>,
    pub hardware_model: Option<String>,
    pub is_connected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStorageInfo {
    pub total_space: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub estimated_backup_size: Option<u64>,
}

/// Read-only view of a backup session as reported by the backup creator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub exists: bool,
    pub is_complete: bool,
    pub is_corrupted: bool,
    pub size_bytes: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub manifest_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub chat_id: i64,
    pub guid: Option<String>,
    pub chat_identifier: String,
    pub display_name: Option<String>,
    pub service_name: Option<String>,
    pub participants: Vec<String>,
    pub is_group: bool,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageChannel {
    Sms,
    #[serde(rename = "imessage")]
    IMessage,
}

impl MessageChannel {
    pub fn from_service(service: Option<&str>) -> Self {
        match service {
            Some(s) if s.eq_ignore_ascii_case("imessage") => MessageChannel::IMessage,
            _ => MessageChannel::Sms,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageChannel::Sms => "sms",
            MessageChannel::IMessage => "imessage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub guid: String,
    pub text: Option<String>,
    pub transcript: Option<String>,
    pub handle: Option<String>,
    pub sender_name: Option<String>,
    pub is_from_me: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub channel: MessageChannel,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub guid: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub transfer_name: Option<String>,
    pub total_bytes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub record_id: String,
    pub display_name: Option<String>,
    pub organization: Option<String>,
    pub phones: Vec<String>,
    pub emails: Vec<String>,
}

/// A conversation together with its loaded messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationBundle {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    pub contacts: Vec<Contact>,
    pub conversations: Vec<ConversationBundle>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub cancelled: bool,
    pub error: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub decrypted_path: Option<PathBuf>,
    pub needs_cleanup: bool,
    pub contacts_count: usize,
    pub conversations_count: usize,
    pub messages_count: usize,
    pub duration: Duration,
    pub data: Option<SyncData>,
}

impl SyncResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            error: Some("Sync cancelled".to_string()),
            ..Self::default()
        }
    }

    /// Path the extracted data was read from; the decrypted copy when one exists.
    pub fn working_path(&self) -> Option<&PathBuf> {
        self.decrypted_path.as_ref().or(self.backup_path.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistStatus {
    Exported,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub stored: usize,
    pub skipped: usize,
}

impl EntityCounts {
    pub fn record(&mut self, status: PersistStatus) {
        match status {
            PersistStatus::Exported => self.stored += 1,
            PersistStatus::Skipped | PersistStatus::Error => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.stored + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistResult {
    pub success: bool,
    pub messages: EntityCounts,
    pub contacts: EntityCounts,
    pub attachments: EntityCounts,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub messages: i64,
    pub conversations: i64,
    pub contacts: i64,
    pub attachments: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub external_id: String,
    pub conversation_id: String,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub is_from_me: bool,
    pub channel: String,
    pub body: Option<String>,
    pub sent_at: Option<i64>,
}
