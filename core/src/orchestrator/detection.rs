use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::collaborators::DeviceDiscovery;
use crate::models::Device;

use super::events::{EventBus, SyncEvent};

const STOP_POLL: Duration = Duration::from_millis(25);

/// Background poller that turns device list snapshots into connect and
/// disconnect events.
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub fn spawn(discovery: Arc<dyn DeviceDiscovery>, events: Arc<EventBus>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut known: BTreeMap<String, Device> = BTreeMap::new();
            while !stop_flag.load(Ordering::SeqCst) {
                let current = discovery.connected_devices();
                let (connected, disconnected) = diff_devices(&known, &current);
                for device in disconnected {
                    log::info!("[DeviceSync] device disconnected: {}", device.id);
                    known.remove(&device.id);
                    events.emit(SyncEvent::DeviceDisconnected { device });
                }
                for device in connected {
                    log::info!("[DeviceSync] device connected: {}", device.id);
                    known.insert(device.id.clone(), device.clone());
                    events.emit(SyncEvent::DeviceConnected { device });
                }
                sleep_unless_stopped(&stop_flag, interval);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("[DeviceSync] device watcher thread panicked");
            }
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, interval: Duration) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

/// Returns `(connected, disconnected)` relative to the previous snapshot.
pub fn diff_devices(previous: &BTreeMap<String, Device>, current: &[Device]) -> (Vec<Device>, Vec<Device>) {
    let connected: Vec<Device> = current
        .iter()
        .filter(|device| !previous.contains_key(&device.id))
        .cloned()
        .collect();
    let disconnected: Vec<Device> = previous
        .values()
        .filter(|device| !current.iter().any(|c| c.id == device.id))
        .map(|device| Device {
            is_connected: false,
            ..device.clone()
        })
        .collect();
    (connected, disconnected)
}
