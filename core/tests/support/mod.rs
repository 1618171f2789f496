#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};

use handset_sync_core::collaborators::{
    BackupCreator, BackupOutcome, BackupPhase, BackupProgress, BackupRequest, DecryptOutcome, Decryptor,
    DeviceDiscovery, DiskSpaceProbe,
};
use handset_sync_core::contacts::AddressBookContacts;
use handset_sync_core::models::{BackupMetadata, BackupStatus, Device, DeviceStorageInfo};
use handset_sync_core::orchestrator::Collaborators;
use handset_sync_core::CoreError;

pub struct FakeBackup {
    pub backup_path: Option<PathBuf>,
    pub encrypted: bool,
    pub fail_with: Option<String>,
    pub block_until_cancel: bool,
    pub status: Mutex<BackupStatus>,
    pub manifest: Mutex<String>,
    pub starts: AtomicUsize,
    pub requests: Mutex<Vec<BackupRequest>>,
    pub started: Mutex<Option<Sender<()>>>,
    cancelled: (Mutex<bool>, Condvar),
}

impl FakeBackup {
    pub fn new(backup_path: &Path) -> Self {
        Self {
            backup_path: Some(backup_path.to_path_buf()),
            encrypted: false,
            fail_with: None,
            block_until_cancel: false,
            status: Mutex::new(BackupStatus::default()),
            manifest: Mutex::new("manifest-1".to_string()),
            starts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            started: Mutex::new(None),
            cancelled: (Mutex::new(false), Condvar::new()),
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl BackupCreator for FakeBackup {
    fn start_backup(&self, request: &BackupRequest, progress: &dyn Fn(BackupProgress)) -> BackupOutcome {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let update = |phase, percent: Option<f64>, bytes: u64| BackupProgress {
            phase,
            percent_complete: percent,
            files_transferred: bytes / 10,
            bytes_transferred: bytes,
        };
        progress(update(BackupPhase::Preparing, Some(0.0), 0));
        progress(update(BackupPhase::WaitingForPasscode, None, 0));
        progress(update(BackupPhase::WaitingForPasscode, None, 0));
        progress(update(BackupPhase::Transferring, Some(40.0), 400));
        progress(update(BackupPhase::Transferring, Some(100.0), 1_000));
        progress(update(BackupPhase::Finishing, Some(100.0), 1_000));

        if self.block_until_cancel {
            if let Some(tx) = self.started.lock().unwrap().take() {
                let _ = tx.send(());
            }
            let (lock, cvar) = &self.cancelled;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cvar.wait(done).unwrap();
            }
            return BackupOutcome {
                success: false,
                error: Some("Backup cancelled by user".to_string()),
                ..BackupOutcome::default()
            };
        }
        if let Some(message) = &self.fail_with {
            return BackupOutcome {
                success: false,
                error: Some(message.clone()),
                ..BackupOutcome::default()
            };
        }
        let mut status = self.status.lock().unwrap();
        status.exists = true;
        status.is_complete = true;
        status.is_corrupted = false;
        BackupOutcome {
            success: true,
            error: None,
            backup_path: self.backup_path.clone(),
            is_encrypted: self.encrypted,
        }
    }

    fn cancel_backup(&self) {
        let (lock, cvar) = &self.cancelled;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn check_backup_status(&self, _device_id: &str) -> BackupStatus {
        self.status.lock().unwrap().clone()
    }

    fn get_backup_metadata(&self, backup_path: &Path) -> Result<BackupMetadata, CoreError> {
        if !backup_path.exists() {
            return Err(CoreError::InvalidArgument("no manifest".to_string()));
        }
        Ok(BackupMetadata {
            manifest_hash: self.manifest.lock().unwrap().clone(),
        })
    }
}

pub struct FakeDecryptor {
    pub output: PathBuf,
    pub expected_password: String,
    pub decrypts: AtomicUsize,
    pub cleaned: Mutex<Vec<PathBuf>>,
    /// Runs inside `decrypt_backup`, after the password check.
    pub on_decrypt: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl FakeDecryptor {
    pub fn new(output: &Path) -> Self {
        Self {
            output: output.to_path_buf(),
            expected_password: "correct horse".to_string(),
            decrypts: AtomicUsize::new(0),
            cleaned: Mutex::new(Vec::new()),
            on_decrypt: Mutex::new(None),
        }
    }
}

impl Decryptor for FakeDecryptor {
    fn is_backup_encrypted(&self, _backup_path: &Path) -> bool {
        true
    }

    fn decrypt_backup(&self, _backup_path: &Path, password: &str) -> DecryptOutcome {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        if password != self.expected_password {
            return DecryptOutcome {
                success: false,
                error: Some("Incorrect backup password".to_string()),
                decrypted_path: None,
            };
        }
        if let Some(hook) = self.on_decrypt.lock().unwrap().as_ref() {
            hook();
        }
        DecryptOutcome {
            success: true,
            error: None,
            decrypted_path: Some(self.output.clone()),
        }
    }

    fn cleanup(&self, decrypted_path: &Path) -> Result<(), CoreError> {
        self.cleaned.lock().unwrap().push(decrypted_path.to_path_buf());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub devices: Mutex<Vec<Device>>,
    pub estimated_backup_size: Option<u64>,
}

impl DeviceDiscovery for FakeDevices {
    fn connected_devices(&self) -> Vec<Device> {
        self.devices.lock().unwrap().clone()
    }

    fn device_storage_info(&self, _device_id: &str) -> Option<DeviceStorageInfo> {
        Some(DeviceStorageInfo {
            total_space: 64 << 30,
            used_space: 20 << 30,
            free_space: 44 << 30,
            estimated_backup_size: self.estimated_backup_size,
        })
    }
}

pub struct FixedDisk(pub Option<u64>);

impl DiskSpaceProbe for FixedDisk {
    fn free_space(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

pub fn phone(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Test Phone {id}"),
        product_version: Some("17.5".to_string()),
        hardware_model: Some("D83AP".to_string()),
        is_connected: true,
    }
}

pub struct Harness {
    pub backup: Arc<FakeBackup>,
    pub decryptor: Arc<FakeDecryptor>,
    pub devices: Arc<FakeDevices>,
}

impl Harness {
    pub fn new(backup: FakeBackup, decrypted_root: &Path) -> Self {
        Self {
            backup: Arc::new(backup),
            decryptor: Arc::new(FakeDecryptor::new(decrypted_root)),
            devices: Arc::new(FakeDevices::default()),
        }
    }

    pub fn collaborators(&self, free_space: Option<u64>) -> Collaborators {
        Collaborators {
            backup: self.backup.clone(),
            decryptor: self.decryptor.clone(),
            contacts: Box::new(AddressBookContacts::new()),
            devices: self.devices.clone(),
            disk: Arc::new(FixedDisk(free_space)),
        }
    }
}
