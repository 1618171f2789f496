mod support;

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use handset_sync_core::models::BackupStatus;
use handset_sync_core::orchestrator::{
    SyncPhase, ERR_ALREADY_RUNNING, ERR_BACKUP_NOT_FOUND, ERR_PASSWORD_REQUIRED, SKIP_REASON_UNCHANGED,
};
use handset_sync_core::seed::{seed_demo_backup, DEMO_PARTNER_HANDLE};
use handset_sync_core::{SyncConfig, SyncEvent, SyncOptions, SyncOrchestrator};
use support::{phone, FakeBackup, FakeDevices, Harness};
use tempfile::tempdir;

const DEVICE: &str = "00008110-000A1B2C3D4E5F";

fn seeded(root: &Path, name: &str) -> PathBuf {
    let path = root.join(name);
    seed_demo_backup(&path, 6, 2).expect("seed");
    path
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        backup_root: root.to_path_buf(),
        ..SyncConfig::default()
    }
}

fn progress_messages(events: &[SyncEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::Progress(progress) => Some(progress.message.clone()),
            _ => None,
        })
        .collect()
}

fn wait_for(rx: &Receiver<SyncEvent>, matches: impl Fn(&SyncEvent) -> bool) -> Option<SyncEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(event) if matches(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[test]
fn full_sync_reads_and_resolves_seeded_backup() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let harness = Harness::new(FakeBackup::new(&backup), &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));
    let (_id, rx) = orchestrator.subscribe();

    let result = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(result.success, "sync failed: {:?}", result.error);
    assert!(!result.skipped);
    assert!(!result.needs_cleanup);
    assert_eq!(result.backup_path.as_deref(), Some(backup.as_path()));
    assert_eq!(result.contacts_count, 2);
    assert_eq!(result.conversations_count, 3);
    assert_eq!(result.messages_count, 8);
    assert_eq!(harness.backup.start_count(), 1);

    let data = result.data.expect("data");
    let direct = data
        .conversations
        .iter()
        .find(|bundle| bundle.conversation.chat_id == 1)
        .expect("direct chat");
    assert_eq!(data.conversations[0].conversation.chat_id, 1);
    assert_eq!(direct.conversation.participants, vec!["Pat Partner".to_string()]);
    assert_eq!(direct.messages.len(), 6);
    assert_eq!(direct.messages[4].text.as_deref(), Some("Demo message 5"));
    let reply = &direct.messages[1];
    assert!(!reply.is_from_me);
    assert_eq!(reply.handle.as_deref(), Some(DEMO_PARTNER_HANDLE));
    assert_eq!(reply.sender_name.as_deref(), Some("Pat Partner"));
    assert!(direct.messages[0].sender_name.is_none());

    let group = data
        .conversations
        .iter()
        .find(|bundle| bundle.conversation.chat_id == 2)
        .expect("group chat");
    assert!(group.conversation.is_group);
    assert_eq!(
        group.conversation.participants,
        vec!["Fran".to_string(), "+15550002222".to_string()]
    );

    let events: Vec<SyncEvent> = rx.try_iter().collect();
    let ready = events
        .iter()
        .position(|event| matches!(event, SyncEvent::Progress(p) if p.message == "Backup ready"))
        .expect("backup ready event");
    for event in &events[..ready] {
        if let SyncEvent::Progress(progress) = event {
            assert!(progress.phase_percent <= 99.0, "{:?}", progress);
        }
    }
    let passcode_prompts = events
        .iter()
        .filter(|event| matches!(event, SyncEvent::WaitingForPasscode { .. }))
        .count();
    assert_eq!(passcode_prompts, 1);
    assert!(matches!(
        events.last(),
        Some(SyncEvent::Complete {
            contacts: 2,
            conversations: 3,
            messages: 8
        })
    ));

    let overall: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::Progress(p) if p.phase != SyncPhase::Backup => Some(p.overall_percent),
            _ => None,
        })
        .collect();
    assert!(overall.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", overall);

    let status = orchestrator.status();
    assert!(!status.is_running);
    assert_eq!(status.phase, SyncPhase::Complete);
    let last = orchestrator.last_sync(DEVICE).expect("last sync");
    assert_eq!(last.manifest_hash.as_deref(), Some("manifest-1"));
}

#[test]
fn unchanged_manifest_skips_until_forced() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let harness = Harness::new(FakeBackup::new(&backup), &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));

    assert!(orchestrator.sync(SyncOptions::new(DEVICE)).success);
    let second = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(second.success);
    assert!(second.skipped);
    assert_eq!(second.skip_reason.as_deref(), Some(SKIP_REASON_UNCHANGED));
    assert!(second.data.is_none());
    assert_eq!(harness.backup.start_count(), 1);
    assert_eq!(orchestrator.status().phase, SyncPhase::Idle);

    let forced = orchestrator.sync(SyncOptions {
        force_resync: true,
        ..SyncOptions::new(DEVICE)
    });
    assert!(forced.success && !forced.skipped);
    assert_eq!(harness.backup.start_count(), 2);

    *harness.backup.manifest.lock().unwrap() = "manifest-2".to_string();
    let changed = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(changed.success && !changed.skipped);
    assert_eq!(harness.backup.start_count(), 3);
}

#[test]
fn sync_cache_file_survives_a_new_orchestrator() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let cfg = SyncConfig {
        sync_cache_path: Some(dir.path().join("state").join("last_sync.json")),
        ..config(dir.path())
    };

    let first = Harness::new(FakeBackup::new(&backup), &dir.path().join("unused"));
    {
        let orchestrator = SyncOrchestrator::new(first.collaborators(None), cfg.clone());
        assert!(orchestrator.sync(SyncOptions::new(DEVICE)).success);
    }

    let fake = FakeBackup::new(&backup);
    *fake.status.lock().unwrap() = BackupStatus {
        exists: true,
        is_complete: true,
        ..BackupStatus::default()
    };
    let second = Harness::new(fake, &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(second.collaborators(None), cfg);
    assert!(orchestrator.last_sync(DEVICE).is_some());
    let result = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(result.skipped);
    assert_eq!(second.backup.start_count(), 0);
}

#[test]
fn encrypted_backup_needs_password_then_processes_existing() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let decrypted = seeded(dir.path(), "decrypted");
    let mut fake = FakeBackup::new(&backup);
    fake.encrypted = true;
    let harness = Harness::new(fake, &decrypted);
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));
    let (_id, rx) = orchestrator.subscribe();

    let locked = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(!locked.success);
    assert_eq!(locked.error.as_deref(), Some(ERR_PASSWORD_REQUIRED));
    assert_eq!(locked.backup_path.as_deref(), Some(backup.as_path()));
    let events: Vec<SyncEvent> = rx.try_iter().collect();
    let prompts: Vec<&SyncEvent> = events
        .iter()
        .filter(|event| matches!(event, SyncEvent::PasswordRequired { .. }))
        .collect();
    assert_eq!(prompts.len(), 1);
    assert!(matches!(prompts[0], SyncEvent::PasswordRequired { device_id } if device_id == DEVICE));
    assert_eq!(orchestrator.status().phase, SyncPhase::Error);

    let wrong = orchestrator.process_existing_backup(SyncOptions::new(DEVICE).with_password("nope"), &backup);
    assert_eq!(wrong.error.as_deref(), Some("Incorrect backup password"));

    let unlocked =
        orchestrator.process_existing_backup(SyncOptions::new(DEVICE).with_password("correct horse"), &backup);
    assert!(unlocked.success, "sync failed: {:?}", unlocked.error);
    assert!(unlocked.needs_cleanup);
    assert_eq!(unlocked.decrypted_path.as_deref(), Some(decrypted.as_path()));
    assert_eq!(unlocked.messages_count, 8);
    assert_eq!(harness.backup.start_count(), 1);

    orchestrator.cleanup_decrypted(&decrypted).expect("cleanup");
    assert_eq!(*harness.decryptor.cleaned.lock().unwrap(), vec![decrypted.clone()]);
}

#[test]
fn cancel_interrupts_a_blocked_backup() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let mut fake = FakeBackup::new(&backup);
    fake.block_until_cancel = true;
    let (started_tx, started_rx) = mpsc::channel();
    *fake.started.lock().unwrap() = Some(started_tx);
    let harness = Harness::new(fake, &backup);
    let orchestrator = Arc::new(SyncOrchestrator::new(harness.collaborators(None), config(dir.path())));

    let worker = {
        let orchestrator = orchestrator.clone();
        thread::spawn(move || orchestrator.sync(SyncOptions::new(DEVICE)))
    };
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("backup started");

    let status = orchestrator.status();
    assert!(status.is_running);
    assert_eq!(status.phase, SyncPhase::Backup);
    let concurrent = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(!concurrent.success);
    assert_eq!(concurrent.error.as_deref(), Some(ERR_ALREADY_RUNNING));

    orchestrator.cancel();
    let result = worker.join().expect("worker");
    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Sync cancelled"));

    let status = orchestrator.status();
    assert!(!status.is_running);
    assert_eq!(status.phase, SyncPhase::Idle);

    let next = orchestrator.process_existing_backup(SyncOptions::new(DEVICE).with_password("correct horse"), &backup);
    assert!(next.success, "cancel leaked into the next sync: {:?}", next.error);
    assert!(!next.cancelled);
}

#[test]
fn cancel_while_idle_is_ignored() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let harness = Harness::new(FakeBackup::new(&backup), &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));

    orchestrator.cancel();
    let result = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(result.success, "sync failed: {:?}", result.error);
    assert!(!result.cancelled);
    assert_eq!(result.messages_count, 8);
}

#[test]
fn cancel_during_decryption_cleans_up_the_copy() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let decrypted = seeded(dir.path(), "decrypted");
    let mut fake = FakeBackup::new(&backup);
    fake.encrypted = true;
    let harness = Harness::new(fake, &decrypted);
    let orchestrator = Arc::new(SyncOrchestrator::new(harness.collaborators(None), config(dir.path())));
    let handle = Arc::downgrade(&orchestrator);
    *harness.decryptor.on_decrypt.lock().unwrap() = Some(Box::new(move || {
        if let Some(orchestrator) = handle.upgrade() {
            orchestrator.cancel();
        }
    }));

    let result = orchestrator.sync(SyncOptions::new(DEVICE).with_password("correct horse"));
    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result.decrypted_path.is_none());
    assert!(!result.needs_cleanup);
    assert_eq!(result.backup_path.as_deref(), Some(backup.as_path()));
    assert_eq!(*harness.decryptor.cleaned.lock().unwrap(), vec![decrypted]);
    assert_eq!(orchestrator.status().phase, SyncPhase::Idle);
}

#[test]
fn insufficient_disk_space_fails_before_backup() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let mut harness = Harness::new(FakeBackup::new(&backup), &dir.path().join("unused"));
    harness.devices = Arc::new(FakeDevices {
        estimated_backup_size: Some(1 << 20),
        ..FakeDevices::default()
    });
    let orchestrator = SyncOrchestrator::new(harness.collaborators(Some(1024)), config(dir.path()));
    let (_id, rx) = orchestrator.subscribe();

    let result = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(!result.success);
    let error = result.error.expect("error");
    assert!(error.starts_with("Insufficient disk space"), "{}", error);
    assert_eq!(harness.backup.start_count(), 0);
    assert!(rx
        .try_iter()
        .any(|event| matches!(event, SyncEvent::Error { message } if message == error)));
    assert_eq!(orchestrator.status().phase, SyncPhase::Error);
}

#[test]
fn missing_backup_output_is_reported() {
    let dir = tempdir().expect("temp");
    let mut fake = FakeBackup::new(dir.path());
    fake.backup_path = None;
    let harness = Harness::new(fake, &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));

    let result = orchestrator.sync(SyncOptions::new(DEVICE));
    assert_eq!(result.error.as_deref(), Some(ERR_BACKUP_NOT_FOUND));

    let existing = orchestrator.process_existing_backup(SyncOptions::new(DEVICE), &dir.path().join("nowhere"));
    assert_eq!(existing.error.as_deref(), Some(ERR_BACKUP_NOT_FOUND));
}

#[test]
fn backup_creator_failure_is_passed_through() {
    let dir = tempdir().expect("temp");
    let mut fake = FakeBackup::new(dir.path());
    fake.fail_with = Some("Device locked".to_string());
    let harness = Harness::new(fake, &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));

    let result = orchestrator.sync(SyncOptions::new(DEVICE));
    assert!(!result.success && !result.cancelled);
    assert_eq!(result.error.as_deref(), Some("Device locked"));
    assert!(!orchestrator.status().is_running);
}

#[test]
fn previous_backup_state_shapes_the_request() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let fake = FakeBackup::new(&backup);
    *fake.status.lock().unwrap() = BackupStatus {
        exists: true,
        is_complete: false,
        ..BackupStatus::default()
    };
    let harness = Harness::new(fake, &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));
    let (_id, rx) = orchestrator.subscribe();

    assert!(orchestrator.sync(SyncOptions::new(DEVICE)).success);
    let messages = progress_messages(&rx.try_iter().collect::<Vec<_>>());
    assert!(messages.iter().any(|m| m == "Previous backup is incomplete, resuming"));
    {
        let requests = harness.backup.requests.lock().unwrap();
        assert!(!requests[0].force_full_backup);
        assert!(requests[0].skip_apps);
        assert_eq!(requests[0].device_id, DEVICE);
    }

    *harness.backup.status.lock().unwrap() = BackupStatus {
        exists: true,
        is_corrupted: true,
        ..BackupStatus::default()
    };
    assert!(orchestrator
        .sync(SyncOptions {
            force_resync: true,
            ..SyncOptions::new(DEVICE)
        })
        .success);
    let messages = progress_messages(&rx.try_iter().collect::<Vec<_>>());
    assert!(messages.iter().any(|m| m.contains("corrupted")));
    assert!(harness.backup.requests.lock().unwrap()[1].force_full_backup);
}

#[test]
fn device_detection_reports_connect_and_disconnect() {
    let dir = tempdir().expect("temp");
    let harness = Harness::new(FakeBackup::new(dir.path()), &dir.path().join("unused"));
    harness.devices.devices.lock().unwrap().push(phone("A1"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));
    let (_id, rx) = orchestrator.subscribe();
    assert_eq!(orchestrator.connected_devices().len(), 1);

    orchestrator.start_device_detection(Duration::from_millis(20));
    let connected = wait_for(&rx, |event| matches!(event, SyncEvent::DeviceConnected { .. }));
    assert!(matches!(connected, Some(SyncEvent::DeviceConnected { device }) if device.id == "A1"));

    harness.devices.devices.lock().unwrap().clear();
    let gone = wait_for(&rx, |event| matches!(event, SyncEvent::DeviceDisconnected { .. }));
    match gone {
        Some(SyncEvent::DeviceDisconnected { device }) => {
            assert_eq!(device.id, "A1");
            assert!(!device.is_connected);
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    orchestrator.stop_device_detection();
}

#[test]
fn unsubscribed_listener_stops_receiving() {
    let dir = tempdir().expect("temp");
    let backup = seeded(dir.path(), "backup");
    let harness = Harness::new(FakeBackup::new(&backup), &dir.path().join("unused"));
    let orchestrator = SyncOrchestrator::new(harness.collaborators(None), config(dir.path()));
    let (id, rx) = orchestrator.subscribe();
    assert!(orchestrator.unsubscribe(id));
    assert!(!orchestrator.unsubscribe(id));
    assert!(orchestrator.sync(SyncOptions::new(DEVICE)).success);
    assert!(rx.try_iter().next().is_none());
}
