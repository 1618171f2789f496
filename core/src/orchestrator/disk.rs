use std::path::Path;

use libc::statvfs;

use crate::collaborators::DiskSpaceProbe;
use crate::config::SyncConfig;
use crate::error::CoreError;

/// Free space of the filesystem holding a path, via `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskSpaceProbe for StatvfsProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        available_space(path)
    }
}

fn available_space(path: &Path) -> Option<u64> {
    let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes()).ok()?;
    let mut stat: statvfs = unsafe { std::mem::zeroed() };
    let res = unsafe { statvfs(c_path.as_ptr(), &mut stat) };
    if res != 0 {
        return None;
    }
    let avail = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Some(avail)
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn required_space(observed: Option<u64>, estimated: Option<u64>, config: &SyncConfig) -> u64 {
    match observed.filter(|v| *v > 0).or(estimated.filter(|v| *v > 0)) {
        Some(size) => size.saturating_mul(config.disk_headroom_factor.max(1)),
        None => config.disk_floor_bytes,
    }
}

/// Unknown free space skips the check.
pub fn check_disk_space(probe: &dyn DiskSpaceProbe, path: &Path, required: u64) -> Result<(), CoreError> {
    if let Some(free) = probe.free_space(path) {
        if free < required {
            return Err(CoreError::Collaborator(format!(
                "Insufficient disk space for backup: need ~{}, have {}",
                format_bytes(required),
                format_bytes(free)
            )));
        }
    }
    Ok(())
}
