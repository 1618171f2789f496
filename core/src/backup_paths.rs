//! Locating files inside a hashed backup tree.
//!
//! The backup stores every device file under `root/<h[0..2]>/<h>` where `h` is
//! `SHA1("<domain>-<relative path>")`. Paths coming out of the message store are
//! untrusted, so anything that could step outside the backup root is rejected.

use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};

pub const HOME_DOMAIN: &str = "HomeDomain";
pub const MEDIA_DOMAIN: &str = "MediaDomain";

const SMS_DB_RELATIVE: &str = "Library/SMS/sms.db";
const ADDRESS_BOOK_RELATIVE: &str = "Library/AddressBook/AddressBook.sqlitedb";

const HOME_PREFIX: &str = "~/";
const DEVICE_ROOT_PREFIXES: [&str; 2] = ["/private/var/mobile/", "/var/mobile/"];

pub fn file_id(domain: &str, relative_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"-");
    hasher.update(relative_path.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn sms_db_path(backup_root: &Path) -> PathBuf {
    sharded_path(backup_root, &file_id(HOME_DOMAIN, SMS_DB_RELATIVE))
}

pub fn address_book_path(backup_root: &Path) -> PathBuf {
    sharded_path(backup_root, &file_id(HOME_DOMAIN, ADDRESS_BOOK_RELATIVE))
}

/// Relative path a file id was derived from, with device prefixes stripped.
pub fn relative_device_path(original: &str) -> Option<&str> {
    let relative = if let Some(rest) = original.strip_prefix(HOME_PREFIX) {
        rest
    } else {
        DEVICE_ROOT_PREFIXES
            .iter()
            .find_map(|prefix| original.strip_prefix(prefix))
            .unwrap_or(original)
    };
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() || relative.contains('\\') || relative.contains("..") {
        return None;
    }
    Some(relative)
}

pub fn resolve_attachment_path(backup_root: &Path, domain: &str, original: &str) -> Option<PathBuf> {
    let relative = relative_device_path(original)?;
    let hash = file_id(domain, relative);
    let root = absolute_root(backup_root)?;
    let resolved = normalize(&sharded_path(&root, &hash));
    if resolved != root && resolved.starts_with(&root) {
        Some(resolved)
    } else {
        None
    }
}

fn sharded_path(root: &Path, hash: &str) -> PathBuf {
    root.join(&hash[..2]).join(hash)
}

fn absolute_root(root: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = root.canonicalize() {
        return Some(canonical);
    }
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(root)
    };
    Some(normalize(&absolute))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn well_known_file_ids_match_backup_layout() {
        assert_eq!(
            file_id(HOME_DOMAIN, SMS_DB_RELATIVE),
            "3d0d7e5fb2ce288813306e4d4636395e047a3d28"
        );
        let root = Path::new("/backups/abc");
        assert_eq!(
            sms_db_path(root),
            root.join("3d").join("3d0d7e5fb2ce288813306e4d4636395e047a3d28")
        );
    }

    #[test]
    fn strips_home_and_device_prefixes() {
        let expected = Some("Library/SMS/Attachments/aa/01/IMG_0001.jpeg");
        assert_eq!(relative_device_path("~/Library/SMS/Attachments/aa/01/IMG_0001.jpeg"), expected);
        assert_eq!(
            relative_device_path("/var/mobile/Library/SMS/Attachments/aa/01/IMG_0001.jpeg"),
            expected
        );
        assert_eq!(
            relative_device_path("/private/var/mobile/Library/SMS/Attachments/aa/01/IMG_0001.jpeg"),
            expected
        );
    }

    #[test]
    fn rejects_traversal_and_backslashes() {
        let dir = tempdir().expect("temp");
        for bad in [
            "~/Library/../../etc/passwd",
            "../outside",
            "/var/mobile/Library/SMS/..",
            "~/Library\\SMS\\x.jpg",
            "~/Library/SMS/Attachments/aa/01/a..b.jpg",
            "~/",
        ] {
            assert!(resolve_attachment_path(dir.path(), MEDIA_DOMAIN, bad).is_none(), "{bad}");
        }
    }

    #[test]
    fn resolved_path_is_inside_root() {
        let dir = tempdir().expect("temp");
        let resolved = resolve_attachment_path(dir.path(), MEDIA_DOMAIN, "~/Library/SMS/Attachments/x/y/a.heic")
            .expect("resolved");
        let root = dir.path().canonicalize().expect("canonical");
        assert!(resolved.starts_with(&root));
        let hash = file_id(MEDIA_DOMAIN, "Library/SMS/Attachments/x/y/a.heic");
        assert_eq!(resolved, root.join(&hash[..2]).join(&hash));
    }

    #[test]
    fn relative_root_is_made_absolute() {
        let resolved = resolve_attachment_path(Path::new("not-created/./backup"), MEDIA_DOMAIN, "~/Library/a.png")
            .expect("resolved");
        assert!(resolved.is_absolute());
        assert!(!resolved.to_string_lossy().contains("/./"));
    }
}
