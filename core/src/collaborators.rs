//! Seams to the services the pipeline drives but does not implement: backup
//! creation, decryption, contacts reading, device discovery and disk probing.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CoreError;
use crate::models::{BackupMetadata, BackupStatus, Contact, Device, DeviceStorageInfo};

#[derive(Clone)]
pub struct BackupRequest {
    pub device_id: String,
    pub password: Option<Zeroizing<String>>,
    pub force_full_backup: bool,
    pub skip_apps: bool,
}

impl fmt::Debug for BackupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupRequest")
            .field("device_id", &self.device_id)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("force_full_backup", &self.force_full_backup)
            .field("skip_apps", &self.skip_apps)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    Preparing,
    WaitingForPasscode,
    Transferring,
    Finishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    pub phase: BackupPhase,
    pub percent_complete: Option<f64>,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub is_encrypted: bool,
}

pub trait BackupCreator: Send + Sync {
    /// Blocks until the backup finishes, fails, or is cancelled.
    fn start_backup(&self, request: &BackupRequest, progress: &dyn Fn(BackupProgress)) -> BackupOutcome;
    fn cancel_backup(&self);
    fn check_backup_status(&self, device_id: &str) -> BackupStatus;
    fn get_backup_metadata(&self, backup_path: &Path) -> Result<BackupMetadata, CoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub decrypted_path: Option<PathBuf>,
}

pub trait Decryptor: Send + Sync {
    fn is_backup_encrypted(&self, backup_path: &Path) -> bool;
    fn decrypt_backup(&self, backup_path: &Path, password: &str) -> DecryptOutcome;
    fn cleanup(&self, decrypted_path: &Path) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Phone,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMatch {
    pub contact: Contact,
    pub match_type: MatchType,
}

pub trait ContactsSource: Send {
    fn open(&mut self, backup_path: &Path) -> Result<(), CoreError>;
    fn get_all_contacts(&self) -> Result<Vec<Contact>, CoreError>;
    fn lookup_by_handle(&self, handle: &str) -> Option<ContactMatch>;
    fn close(&mut self);
}

pub trait DeviceDiscovery: Send + Sync {
    fn connected_devices(&self) -> Vec<Device>;
    fn device_storage_info(&self, device_id: &str) -> Option<DeviceStorageInfo>;
}

pub trait DiskSpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> Option<u64>;
}
