//! Sequences one device sync: backup, decrypt, contacts, messages, identity
//! resolution and cleanup. Each `sync` call runs synchronously on the caller's
//! thread; `cancel` and `status` may be called from any other thread.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::backup_paths::sms_db_path;
use crate::collaborators::{
    BackupCreator, BackupPhase, BackupProgress, BackupRequest, ContactsSource, Decryptor, DeviceDiscovery,
    DiskSpaceProbe,
};
use crate::config::SyncConfig;
use crate::contacts::ContactIndex;
use crate::diagnostics::log_event;
use crate::error::CoreError;
use crate::extractor::BackupExtractor;
use crate::models::{BackupStatus, Contact, ConversationBundle, Device, SyncData, SyncResult};
use crate::resolver::resolve_identities;

#[path = "orchestrator/detection.rs"]
pub mod detection;
#[path = "orchestrator/disk.rs"]
pub mod disk;
#[path = "orchestrator/events.rs"]
pub mod events;
#[path = "orchestrator/progress.rs"]
pub mod progress;

pub use detection::DeviceWatcher;
pub use disk::{format_bytes, StatvfsProbe};
pub use events::{EventBus, SubscriptionId, SyncEvent};
pub use progress::{SyncPhase, SyncProgress};

use disk::{check_disk_space, required_space};
use progress::{backup_percent, overall_percent, split_phase_percent};

pub const SKIP_REASON_UNCHANGED: &str = "unchanged";
pub const ERR_ALREADY_RUNNING: &str = "A sync is already in progress";
pub const ERR_BACKUP_NOT_FOUND: &str = "Backup not found";
pub const ERR_PASSWORD_REQUIRED: &str = "Password required to decrypt backup";

pub struct Collaborators {
    pub backup: Arc<dyn BackupCreator>,
    pub decryptor: Arc<dyn Decryptor>,
    pub contacts: Box<dyn ContactsSource>,
    pub devices: Arc<dyn DeviceDiscovery>,
    pub disk: Arc<dyn DiskSpaceProbe>,
}

#[derive(Clone, Default)]
pub struct SyncOptions {
    pub device_id: String,
    pub password: Option<Zeroizing<String>>,
    pub force_full_backup: bool,
    /// Re-run extraction even when the backup manifest has not changed.
    pub force_resync: bool,
}

impl SyncOptions {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("device_id", &self.device_id)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("force_full_backup", &self.force_full_backup)
            .field("force_resync", &self.force_resync)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSync {
    pub backup_path: PathBuf,
    pub manifest_hash: Option<String>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub phase: SyncPhase,
}

/// Owns the running flag for one sync. A cancel request only lives as long
/// as the sync it was aimed at.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
    cancel: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A failure that already carries the paths known at the time it happened.
struct Failure {
    error: CoreError,
    backup_path: Option<PathBuf>,
}

impl From<CoreError> for Failure {
    fn from(error: CoreError) -> Self {
        Self {
            error,
            backup_path: None,
        }
    }
}

pub struct SyncOrchestrator {
    backup: Arc<dyn BackupCreator>,
    decryptor: Arc<dyn Decryptor>,
    contacts: Mutex<Box<dyn ContactsSource>>,
    devices: Arc<dyn DeviceDiscovery>,
    disk: Arc<dyn DiskSpaceProbe>,
    config: SyncConfig,
    events: Arc<EventBus>,
    running: AtomicBool,
    cancel_requested: AtomicBool,
    phase: Mutex<SyncPhase>,
    last_syncs: Mutex<HashMap<String, LastSync>>,
    watcher: Mutex<Option<DeviceWatcher>>,
}

impl SyncOrchestrator {
    pub fn new(collaborators: Collaborators, config: SyncConfig) -> Self {
        let last_syncs = match config.sync_cache_path.as_deref() {
            Some(path) => load_sync_cache(path),
            None => HashMap::new(),
        };
        Self {
            backup: collaborators.backup,
            decryptor: collaborators.decryptor,
            contacts: Mutex::new(collaborators.contacts),
            devices: collaborators.devices,
            disk: collaborators.disk,
            config,
            events: Arc::new(EventBus::new()),
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            phase: Mutex::new(SyncPhase::Idle),
            last_syncs: Mutex::new(last_syncs),
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> (SubscriptionId, std::sync::mpsc::Receiver<SyncEvent>) {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn sync(&self, options: SyncOptions) -> SyncResult {
        self.guarded(&options, None)
    }

    /// Runs the pipeline against a backup that already exists on disk, without
    /// asking the device for a new one.
    pub fn process_existing_backup(&self, options: SyncOptions, backup_path: &Path) -> SyncResult {
        self.guarded(&options, Some(backup_path))
    }

    /// Requests cancellation of the sync in flight. Does nothing while idle.
    pub fn cancel(&self) {
        if !self.running.load(Ordering::SeqCst) {
            log::debug!("[DeviceSync] cancel ignored, no sync running");
            return;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        if !self.running.load(Ordering::SeqCst) {
            // The sync finished in between and its guard already ran.
            self.cancel_requested.store(false, Ordering::SeqCst);
            return;
        }
        log::info!("[DeviceSync] cancellation requested");
        self.backup.cancel_backup();
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_running: self.running.load(Ordering::SeqCst),
            phase: self.current_phase(),
        }
    }

    /// Clears a stuck running flag. Meant for recovery after a caller lost
    /// track of a sync, not for normal cancellation.
    pub fn force_reset(&self) {
        log::warn!("[DeviceSync] forcing orchestrator reset");
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Idle);
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        self.devices.connected_devices()
    }

    pub fn start_device_detection(&self, interval: Duration) {
        if let Ok(mut guard) = self.watcher.lock() {
            if guard.is_none() {
                *guard = Some(DeviceWatcher::spawn(self.devices.clone(), self.events.clone(), interval));
            }
        }
    }

    pub fn stop_device_detection(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut guard| guard.take());
        if let Some(watcher) = watcher {
            watcher.stop();
        }
    }

    pub fn cleanup_decrypted(&self, decrypted_path: &Path) -> Result<(), CoreError> {
        self.decryptor.cleanup(decrypted_path)
    }

    pub fn last_sync(&self, device_id: &str) -> Option<LastSync> {
        self.last_syncs.lock().ok().and_then(|cache| cache.get(device_id).cloned())
    }

    fn guarded(&self, options: &SyncOptions, existing: Option<&Path>) -> SyncResult {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SyncResult::failed(ERR_ALREADY_RUNNING);
        }
        let _running = RunningGuard {
            running: &self.running,
            cancel: &self.cancel_requested,
        };
        let started = Instant::now();
        log::info!("[DeviceSync] sync started for {}", options.device_id);

        let mut result = match self.run(options, existing) {
            Ok(result) => result,
            Err(Failure {
                error: CoreError::Cancelled,
                backup_path,
            }) => {
                log::info!("[DeviceSync] sync cancelled for {}", options.device_id);
                self.set_phase(SyncPhase::Idle);
                self.diagnostic("sync_cancelled", &options.device_id);
                SyncResult {
                    backup_path,
                    ..SyncResult::cancelled()
                }
            }
            Err(Failure { error, backup_path }) => {
                let message = error.to_string();
                log::error!("[DeviceSync] sync failed: {}", message);
                self.set_phase(SyncPhase::Error);
                self.events.emit(SyncEvent::Error {
                    message: message.clone(),
                });
                self.diagnostic("sync_error", &message);
                SyncResult {
                    backup_path,
                    ..SyncResult::failed(message)
                }
            }
        };
        result.duration = started.elapsed();
        result
    }

    fn run(&self, options: &SyncOptions, existing: Option<&Path>) -> Result<SyncResult, Failure> {
        let device_id = options.device_id.as_str();
        self.set_phase(SyncPhase::Backup);

        let status = self.backup.check_backup_status(device_id);
        if status.exists || existing.is_some() {
            if let Some(skipped) = self.skip_if_unchanged(options, existing) {
                return Ok(skipped);
            }
        }
        let force_full = options.force_full_backup || status.is_corrupted;
        self.emit_progress(SyncPhase::Backup, 0.0, backup_state_message(&status, existing.is_some()));

        let (backup_path, is_encrypted) = match existing {
            Some(path) => {
                if !path.exists() {
                    return Err(CoreError::Collaborator(ERR_BACKUP_NOT_FOUND.to_string()).into());
                }
                (path.to_path_buf(), self.decryptor.is_backup_encrypted(path))
            }
            None => self.create_backup(options, &status, force_full)?,
        };
        self.emit_progress(SyncPhase::Backup, 100.0, "Backup ready".to_string());
        self.check_cancelled().map_err(|error| Failure {
            error,
            backup_path: Some(backup_path.clone()),
        })?;

        let decrypted_path = if is_encrypted {
            self.set_phase(SyncPhase::Decrypting);
            Some(self.decrypt(options, &backup_path).map_err(|error| Failure {
                error,
                backup_path: Some(backup_path.clone()),
            })?)
        } else {
            None
        };
        let working = decrypted_path.clone().unwrap_or_else(|| backup_path.clone());

        let data = match self.check_cancelled().and_then(|()| self.extract(&working)) {
            Ok(data) => data,
            Err(error) => {
                if let Some(path) = decrypted_path.as_deref() {
                    if let Err(err) = self.decryptor.cleanup(path) {
                        log::warn!("[DeviceSync] decrypted copy cleanup failed: {}", err);
                    }
                }
                return Err(Failure {
                    error,
                    backup_path: Some(backup_path),
                });
            }
        };

        self.set_phase(SyncPhase::Cleanup);
        let needs_cleanup = decrypted_path.is_some();
        self.emit_progress(SyncPhase::Cleanup, 100.0, "Finishing sync".to_string());

        let manifest_hash = match self.backup.get_backup_metadata(&backup_path) {
            Ok(meta) => Some(meta.manifest_hash),
            Err(err) => {
                log::debug!("[DeviceSync] no manifest metadata for {}: {}", backup_path.display(), err);
                None
            }
        };
        self.record_last_sync(
            device_id,
            LastSync {
                backup_path: backup_path.clone(),
                manifest_hash,
                synced_at: Utc::now(),
            },
        );

        let contacts_count = data.contacts.len();
        let conversations_count = data.conversations.len();
        let messages_count = data.conversations.iter().map(|bundle| bundle.messages.len()).sum();
        self.set_phase(SyncPhase::Complete);
        self.events.emit(SyncEvent::Complete {
            contacts: contacts_count,
            conversations: conversations_count,
            messages: messages_count,
        });
        log::info!(
            "[DeviceSync] sync complete: {} contacts, {} conversations, {} messages",
            contacts_count,
            conversations_count,
            messages_count
        );
        self.diagnostic(
            "sync_complete",
            &format!(
                "contacts={} conversations={} messages={}",
                contacts_count, conversations_count, messages_count
            ),
        );

        Ok(SyncResult {
            success: true,
            backup_path: Some(backup_path),
            decrypted_path,
            needs_cleanup,
            contacts_count,
            conversations_count,
            messages_count,
            data: Some(data),
            ..SyncResult::default()
        })
    }

    fn skip_if_unchanged(&self, options: &SyncOptions, existing: Option<&Path>) -> Option<SyncResult> {
        if options.force_resync {
            return None;
        }
        let cached = self.last_sync(&options.device_id)?;
        let cached_hash = cached.manifest_hash.as_deref()?;
        let path = existing.unwrap_or(cached.backup_path.as_path());
        let current = match self.backup.get_backup_metadata(path) {
            Ok(meta) => meta.manifest_hash,
            Err(err) => {
                log::debug!("[DeviceSync] manifest unreadable, syncing anyway: {}", err);
                return None;
            }
        };
        if current != cached_hash {
            return None;
        }
        log::info!("[DeviceSync] backup unchanged since {}, skipping", cached.synced_at);
        self.emit_progress(
            SyncPhase::Complete,
            100.0,
            "Backup unchanged since last sync".to_string(),
        );
        self.set_phase(SyncPhase::Idle);
        Some(SyncResult {
            success: true,
            skipped: true,
            skip_reason: Some(SKIP_REASON_UNCHANGED.to_string()),
            backup_path: Some(path.to_path_buf()),
            ..SyncResult::default()
        })
    }

    fn create_backup(
        &self,
        options: &SyncOptions,
        status: &BackupStatus,
        force_full: bool,
    ) -> Result<(PathBuf, bool), Failure> {
        let device_id = options.device_id.as_str();
        let estimate = self
            .devices
            .device_storage_info(device_id)
            .and_then(|info| info.estimated_backup_size);
        let observed = if status.exists { status.size_bytes } else { None };
        let required = required_space(observed, estimate, &self.config);
        check_disk_space(self.disk.as_ref(), &self.config.backup_root, required)?;

        let request = BackupRequest {
            device_id: device_id.to_string(),
            password: options.password.clone(),
            force_full_backup: force_full,
            skip_apps: self.config.skip_apps,
        };
        let passcode_notified = AtomicBool::new(false);
        let on_progress = |update: BackupProgress| {
            if update.phase == BackupPhase::WaitingForPasscode {
                if !passcode_notified.swap(true, Ordering::SeqCst) {
                    self.events.emit(SyncEvent::WaitingForPasscode {
                        device_id: device_id.to_string(),
                    });
                }
                self.emit_progress(
                    SyncPhase::Backup,
                    backup_percent(&update, estimate),
                    "Waiting for passcode on device".to_string(),
                );
                return;
            }
            let percent = backup_percent(&update, estimate);
            self.emit_progress(
                SyncPhase::Backup,
                percent,
                format!("Backing up device... {:.0}% ({} files)", percent, update.files_transferred),
            );
        };
        let outcome = self.backup.start_backup(&request, &on_progress);

        self.check_cancelled()?;
        if !outcome.success {
            let message = outcome.error.unwrap_or_else(|| "Backup failed".to_string());
            return Err(CoreError::Collaborator(message).into());
        }
        match outcome.backup_path {
            Some(path) if path.exists() => Ok((path, outcome.is_encrypted)),
            _ => Err(CoreError::Collaborator(ERR_BACKUP_NOT_FOUND.to_string()).into()),
        }
    }

    fn decrypt(&self, options: &SyncOptions, backup_path: &Path) -> Result<PathBuf, CoreError> {
        let Some(password) = options.password.as_ref() else {
            self.events.emit(SyncEvent::PasswordRequired {
                device_id: options.device_id.clone(),
            });
            return Err(CoreError::Collaborator(ERR_PASSWORD_REQUIRED.to_string()));
        };
        self.emit_progress(SyncPhase::Decrypting, 0.0, "Decrypting backup...".to_string());
        let outcome = self.decryptor.decrypt_backup(backup_path, password.as_str());
        if !outcome.success {
            return Err(CoreError::Collaborator(
                outcome.error.unwrap_or_else(|| "Decryption failed".to_string()),
            ));
        }
        let decrypted = outcome
            .decrypted_path
            .ok_or_else(|| CoreError::Collaborator("Decryption produced no output".to_string()))?;
        self.emit_progress(SyncPhase::Decrypting, 100.0, "Backup decrypted".to_string());
        Ok(decrypted)
    }

    fn extract(&self, working: &Path) -> Result<SyncData, CoreError> {
        self.set_phase(SyncPhase::ParsingContacts);
        self.emit_progress(SyncPhase::ParsingContacts, 0.0, "Reading contacts...".to_string());
        let contacts = self.read_contacts(working);
        self.emit_progress(
            SyncPhase::ParsingContacts,
            100.0,
            format!("Read {} contacts", contacts.len()),
        );
        self.check_cancelled()?;
        let index = ContactIndex::new(contacts);

        self.set_phase(SyncPhase::ParsingMessages);
        let mut extractor = BackupExtractor::with_yield_intervals(
            self.config.conversation_yield_every,
            self.config.message_yield_every,
        );
        let read = self.read_conversations(&mut extractor, working);
        extractor.close();
        let mut conversations = read?;
        self.check_cancelled()?;

        self.set_phase(SyncPhase::Resolving);
        let stats = resolve_identities(&mut conversations, &index);
        log::debug!(
            "[DeviceSync] resolved {} participants and {} senders",
            stats.participants_resolved,
            stats.senders_resolved
        );
        self.emit_progress(SyncPhase::Resolving, 100.0, "Matched contacts".to_string());
        self.check_cancelled()?;

        Ok(SyncData {
            contacts: index.contacts().to_vec(),
            conversations,
        })
    }

    fn read_contacts(&self, working: &Path) -> Vec<Contact> {
        let Ok(mut source) = self.contacts.lock() else {
            log::warn!("[DeviceSync] contacts source lock poisoned");
            return Vec::new();
        };
        let read = match source.open(working) {
            Ok(()) => source.get_all_contacts(),
            Err(err) => Err(err),
        };
        source.close();
        match read {
            Ok(contacts) => contacts,
            Err(err) => {
                log::warn!("[DeviceSync] contacts unavailable: {}", err);
                Vec::new()
            }
        }
    }

    fn read_conversations(
        &self,
        extractor: &mut BackupExtractor,
        working: &Path,
    ) -> Result<Vec<ConversationBundle>, CoreError> {
        extractor.open(&sms_db_path(working))?;
        let conversations = extractor.list_conversations_incremental(&mut |done, total| {
            self.emit_progress(
                SyncPhase::ParsingMessages,
                split_phase_percent(false, done, total),
                format!("Reading conversations... {}/{}", done, total),
            );
            self.cancel_flow()
        })?;
        self.check_cancelled()?;

        let total = conversations.len();
        let progress_every = self.config.conversation_progress_every.max(1);
        let mut bundles = Vec::with_capacity(total);
        for (idx, conversation) in conversations.into_iter().enumerate() {
            let messages = extractor.list_messages_incremental(conversation.chat_id, &mut |_, _| self.cancel_flow())?;
            self.check_cancelled()?;
            bundles.push(ConversationBundle { conversation, messages });
            let done = idx + 1;
            if done % progress_every == 0 || done == total {
                self.emit_progress(
                    SyncPhase::ParsingMessages,
                    split_phase_percent(true, done, total),
                    format!("Reading messages... {}/{} conversations", done, total),
                );
            }
        }
        Ok(bundles)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn cancel_flow(&self) -> ControlFlow<()> {
        if self.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn current_phase(&self) -> SyncPhase {
        self.phase.lock().map(|phase| *phase).unwrap_or(SyncPhase::Error)
    }

    fn set_phase(&self, phase: SyncPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
        log::debug!("[DeviceSync] phase -> {}", phase.as_str());
        self.events.emit(SyncEvent::Phase { phase });
    }

    fn emit_progress(&self, phase: SyncPhase, phase_percent: f64, message: String) {
        let overall = overall_percent(&self.config.phase_weights, phase, phase_percent);
        self.events.emit(SyncEvent::Progress(SyncProgress {
            phase,
            phase_percent,
            overall_percent: overall,
            message,
        }));
    }

    fn record_last_sync(&self, device_id: &str, entry: LastSync) {
        let snapshot = match self.last_syncs.lock() {
            Ok(mut cache) => {
                cache.insert(device_id.to_string(), entry);
                cache.clone()
            }
            Err(_) => return,
        };
        if let Some(path) = self.config.sync_cache_path.as_deref() {
            if let Err(err) = save_sync_cache(path, &snapshot) {
                log::warn!("[DeviceSync] could not write sync cache: {}", err);
            }
        }
    }

    fn diagnostic(&self, kind: &str, message: &str) {
        if let Some(dir) = self.config.diagnostics_dir.as_deref() {
            if let Err(err) = log_event(dir, kind, message) {
                log::debug!("diagnostics write failed: {}", err);
            }
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.stop_device_detection();
    }
}

fn backup_state_message(status: &BackupStatus, existing: bool) -> String {
    if existing {
        "Using existing backup".to_string()
    } else if !status.exists {
        "No previous backup found, creating full backup".to_string()
    } else if status.is_corrupted {
        "Previous backup is corrupted, forcing full backup".to_string()
    } else if !status.is_complete {
        "Previous backup is incomplete, resuming".to_string()
    } else {
        "Previous backup found, running incremental backup".to_string()
    }
}

fn load_sync_cache(path: &Path) -> HashMap<String, LastSync> {
    if !path.exists() {
        return HashMap::new();
    }
    let parsed = fs::read(path)
        .map_err(CoreError::from)
        .and_then(|raw| serde_json::from_slice(&raw).map_err(CoreError::from));
    match parsed {
        Ok(cache) => cache,
        Err(err) => {
            log::warn!("[DeviceSync] ignoring unreadable sync cache: {}", err);
            HashMap::new()
        }
    }
}

fn save_sync_cache(path: &Path, cache: &HashMap<String, LastSync>) -> Result<(), CoreError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(&serde_json::to_vec_pretty(cache)?)?;
    temp.persist(path)
        .map_err(|e| CoreError::InvalidArgument(format!("sync cache persist failed: {}", e)))?;
    Ok(())
}
