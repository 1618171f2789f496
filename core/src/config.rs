use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_MESSAGE_BATCH_SIZE: usize = 500;
pub const DEFAULT_YIELD_EVERY_BATCHES: usize = 2;
pub const DEFAULT_CONVERSATION_YIELD_EVERY: usize = 50;
pub const DEFAULT_MESSAGE_YIELD_EVERY: usize = 500;
pub const DEFAULT_CONVERSATION_PROGRESS_EVERY: usize = 10;
pub const DEFAULT_ATTACHMENT_MAX_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_ATTACHMENT_TOTAL_WARN_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_DISK_FLOOR_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_DISK_HEADROOM_FACTOR: u64 = 2;

/// Relative share of overall progress per phase. Values are percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    pub backup: f64,
    pub decrypt: f64,
    pub contacts: f64,
    pub messages: f64,
    pub resolving: f64,
    pub cleanup: f64,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            backup: 60.0,
            decrypt: 10.0,
            contacts: 5.0,
            messages: 15.0,
            resolving: 5.0,
            cleanup: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory that holds device backups; used for the free space probe.
    pub backup_root: PathBuf,
    pub message_batch_size: usize,
    pub yield_every_batches: usize,
    pub conversation_yield_every: usize,
    pub message_yield_every: usize,
    pub conversation_progress_every: usize,
    pub attachment_max_bytes: u64,
    pub attachment_total_warn_bytes: u64,
    pub attachment_extensions: Vec<String>,
    pub disk_floor_bytes: u64,
    pub disk_headroom_factor: u64,
    pub phase_weights: PhaseWeights,
    pub skip_apps: bool,
    /// When set, the last successful sync per device survives restarts.
    pub sync_cache_path: Option<PathBuf>,
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backup_root: std::env::temp_dir(),
            message_batch_size: DEFAULT_MESSAGE_BATCH_SIZE,
            yield_every_batches: DEFAULT_YIELD_EVERY_BATCHES,
            conversation_yield_every: DEFAULT_CONVERSATION_YIELD_EVERY,
            message_yield_every: DEFAULT_MESSAGE_YIELD_EVERY,
            conversation_progress_every: DEFAULT_CONVERSATION_PROGRESS_EVERY,
            attachment_max_bytes: DEFAULT_ATTACHMENT_MAX_BYTES,
            attachment_total_warn_bytes: DEFAULT_ATTACHMENT_TOTAL_WARN_BYTES,
            attachment_extensions: default_attachment_extensions(),
            disk_floor_bytes: DEFAULT_DISK_FLOOR_BYTES,
            disk_headroom_factor: DEFAULT_DISK_HEADROOM_FACTOR,
            phase_weights: PhaseWeights::default(),
            skip_apps: true,
            sync_cache_path: None,
            diagnostics_dir: None,
        }
    }
}

fn default_attachment_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "gif", "heic", "heif", "webp", "tiff", "bmp", "mov", "mp4", "m4v",
        "3gp", "m4a", "caf", "amr", "mp3", "wav", "aac", "pdf", "vcf", "txt", "pluginpayloadattachment",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

impl SyncConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, CoreError> {
        let raw = fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.message_batch_size == 0 {
            return Err(CoreError::InvalidArgument("message_batch_size must be > 0".to_string()));
        }
        if self.yield_every_batches == 0 || self.conversation_yield_every == 0 || self.message_yield_every == 0 {
            return Err(CoreError::InvalidArgument("yield intervals must be > 0".to_string()));
        }
        if self.conversation_progress_every == 0 {
            return Err(CoreError::InvalidArgument(
                "conversation_progress_every must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_supported_extension(&self, name: &str) -> bool {
        let ext = match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => return false,
        };
        self.attachment_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    }
}
