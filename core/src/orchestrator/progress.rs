use serde::{Deserialize, Serialize};

use crate::collaborators::BackupProgress;
use crate::config::PhaseWeights;

/// Backup progress never reports 100 until the creator call has returned.
pub const BACKUP_PROGRESS_CAP: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Backup,
    Decrypting,
    ParsingContacts,
    ParsingMessages,
    Resolving,
    Cleanup,
    Complete,
    Error,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Backup => "backup",
            SyncPhase::Decrypting => "decrypting",
            SyncPhase::ParsingContacts => "parsing_contacts",
            SyncPhase::ParsingMessages => "parsing_messages",
            SyncPhase::Resolving => "resolving",
            SyncPhase::Cleanup => "cleanup",
            SyncPhase::Complete => "complete",
            SyncPhase::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub phase_percent: f64,
    pub overall_percent: f64,
    pub message: String,
}

const WEIGHTED_PHASES: [SyncPhase; 6] = [
    SyncPhase::Backup,
    SyncPhase::Decrypting,
    SyncPhase::ParsingContacts,
    SyncPhase::ParsingMessages,
    SyncPhase::Resolving,
    SyncPhase::Cleanup,
];

fn weight(weights: &PhaseWeights, phase: SyncPhase) -> f64 {
    let value = match phase {
        SyncPhase::Backup => weights.backup,
        SyncPhase::Decrypting => weights.decrypt,
        SyncPhase::ParsingContacts => weights.contacts,
        SyncPhase::ParsingMessages => weights.messages,
        SyncPhase::Resolving => weights.resolving,
        SyncPhase::Cleanup => weights.cleanup,
        _ => 0.0,
    };
    value.max(0.0)
}

/// Overall percentage for `phase_percent` of `phase`, counting every earlier
/// phase as finished.
pub fn overall_percent(weights: &PhaseWeights, phase: SyncPhase, phase_percent: f64) -> f64 {
    match phase {
        SyncPhase::Idle | SyncPhase::Error => return 0.0,
        SyncPhase::Complete => return 100.0,
        _ => {}
    }
    let total: f64 = WEIGHTED_PHASES.iter().map(|p| weight(weights, *p)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let done: f64 = WEIGHTED_PHASES
        .iter()
        .take_while(|p| **p != phase)
        .map(|p| weight(weights, *p))
        .sum();
    let current = weight(weights, phase) * phase_percent.clamp(0.0, 100.0) / 100.0;
    ((done + current) / total * 100.0).clamp(0.0, 100.0)
}

pub fn backup_percent(progress: &BackupProgress, estimated_bytes: Option<u64>) -> f64 {
    let raw = match estimated_bytes {
        Some(estimate) if estimate > 0 => progress.bytes_transferred as f64 / estimate as f64 * 100.0,
        _ => progress.percent_complete.unwrap_or(0.0),
    };
    raw.clamp(0.0, BACKUP_PROGRESS_CAP)
}

/// The messages phase is split in two: conversation listing, then per-chat reads.
pub fn split_phase_percent(second_half: bool, processed: usize, total: usize) -> f64 {
    let fraction = if total == 0 {
        1.0
    } else {
        (processed as f64 / total as f64).min(1.0)
    };
    let base = if second_half { 50.0 } else { 0.0 };
    base + fraction * 50.0
}
