use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use rusqlite::{params, Transaction};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::backup_paths::{resolve_attachment_path, MEDIA_DOMAIN};
use crate::config::SyncConfig;
use crate::error::CoreError;
use crate::models::{Attachment, ConversationBundle, EntityCounts, PersistStatus};
use crate::orchestrator::format_bytes;

use super::is_valid_guid;

const ATTACHMENT_PROGRESS_EVERY: usize = 100;
const COPY_BUFFER_BYTES: usize = 64 * 1024;

pub(super) fn load_attachments<F>(
    tx: &Transaction<'_>,
    owner: &str,
    backup_root: &Path,
    attachments_dir: &Path,
    config: &SyncConfig,
    bundles: &[ConversationBundle],
    progress: &F,
) -> Result<EntityCounts, CoreError>
where
    F: Fn(&str),
{
    let total: usize = bundles
        .iter()
        .flat_map(|bundle| bundle.messages.iter())
        .map(|message| message.attachments.len())
        .sum();
    let mut counts = EntityCounts::default();
    if total == 0 {
        progress("No attachments found.");
        return Ok(counts);
    }
    fs::create_dir_all(attachments_dir)
        .map_err(|e| CoreError::InvalidArgument(format!("attachments dir failed: {}", e)))?;

    progress("Copying attachments...");
    let mut copied_bytes: u64 = 0;
    let mut warned = false;
    let mut processed = 0usize;
    for message in bundles.iter().flat_map(|bundle| bundle.messages.iter()) {
        let valid_message = is_valid_guid(&message.guid);
        for attachment in &message.attachments {
            processed += 1;
            let status = if valid_message {
                match store_attachment(tx, owner, backup_root, attachments_dir, config, &message.guid, attachment) {
                    Ok((status, bytes)) => {
                        copied_bytes += bytes;
                        status
                    }
                    Err(err) => {
                        log::warn!("attachment {} not stored: {}", attachment.id, err);
                        PersistStatus::Error
                    }
                }
            } else {
                PersistStatus::Skipped
            };
            counts.record(status);

            if !warned && copied_bytes > config.attachment_total_warn_bytes {
                log::warn!(
                    "attachment copies exceed {} for this sync",
                    format_bytes(config.attachment_total_warn_bytes)
                );
                warned = true;
            }
            if processed % ATTACHMENT_PROGRESS_EVERY == 0 {
                progress(&format!(
                    "Copying attachments... {}/{} (stored {}, skipped {})",
                    processed, total, counts.stored, counts.skipped
                ));
            }
        }
    }
    progress(&format!(
        "Attachments copied: total {}, stored {}, skipped {}",
        total, counts.stored, counts.skipped
    ));
    Ok(counts)
}

/// Returns the outcome and the number of bytes newly written to the attachment store.
fn store_attachment(
    tx: &Transaction<'_>,
    owner: &str,
    backup_root: &Path,
    attachments_dir: &Path,
    config: &SyncConfig,
    message_guid: &str,
    attachment: &Attachment,
) -> Result<(PersistStatus, u64), CoreError> {
    let Some(original) = attachment.filename.as_deref() else {
        return Ok((PersistStatus::Skipped, 0));
    };
    let Some(source) = resolve_attachment_path(backup_root, MEDIA_DOMAIN, original) else {
        log::debug!("attachment {} has an unresolvable path", attachment.id);
        return Ok((PersistStatus::Skipped, 0));
    };
    let meta = match fs::metadata(&source) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Ok((PersistStatus::Skipped, 0)),
    };
    let named = attachment.transfer_name.as_deref().unwrap_or(original);
    if !config.is_supported_extension(original) && !config.is_supported_extension(named) {
        return Ok((PersistStatus::Skipped, 0));
    }
    if meta.len() > config.attachment_max_bytes {
        log::debug!("attachment {} exceeds size limit ({} bytes)", attachment.id, meta.len());
        return Ok((PersistStatus::Skipped, 0));
    }

    let (sha256, size, copied) = copy_attachment(&source, attachments_dir)?;
    let attachment_guid = if attachment.guid.is_empty() {
        format!("att:{}", attachment.id)
    } else {
        attachment.guid.clone()
    };
    let changes = tx.execute(
        "INSERT OR IGNORE INTO attachments \
         (owner, message_external_id, attachment_guid, sha256, mime, size_bytes, original_filename, transfer_name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            owner,
            message_guid,
            attachment_guid,
            sha256,
            attachment.mime_type,
            size as i64,
            original,
            attachment.transfer_name,
        ],
    )?;
    let written = if copied { size } else { 0 };
    if changes == 0 {
        Ok((PersistStatus::Skipped, written))
    } else {
        Ok((PersistStatus::Exported, written))
    }
}

/// Streams `src` into `dest_dir/<sha256>`. The copy is only kept when no file
/// with the same content exists yet.
pub(super) fn copy_attachment(src: &Path, dest_dir: &Path) -> Result<(String, u64, bool), CoreError> {
    let mut file = fs::File::open(src)?;
    let mut temp = NamedTempFile::new_in(dest_dir)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        temp.write_all(&buf[..n])?;
        total += n as u64;
    }
    let hash = hex::encode(hasher.finalize());
    let dest = dest_dir.join(&hash);
    if dest.exists() {
        return Ok((hash, total, false));
    }
    temp.persist(&dest)
        .map_err(|e| CoreError::InvalidArgument(format!("attachment persist failed: {}", e)))?;
    Ok((hash, total, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn identical_content_is_stored_once() {
        let dir = tempdir().expect("temp");
        let store = dir.path().join("store");
        fs::create_dir_all(&store).expect("store");
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.jpg");
        fs::write(&a, b"same bytes").expect("a");
        fs::write(&b, b"same bytes").expect("b");

        let (hash_a, size, copied_a) = copy_attachment(&a, &store).expect("copy a");
        let (hash_b, _, copied_b) = copy_attachment(&b, &store).expect("copy b");
        assert_eq!(hash_a, hash_b);
        assert_eq!(size, 10);
        assert!(copied_a);
        assert!(!copied_b);
        let files: Vec<_> = fs::read_dir(&store).expect("read").collect();
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read(store.join(&hash_a)).expect("stored"), b"same bytes");
    }
}
