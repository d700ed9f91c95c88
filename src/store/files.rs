//! On-disk layout of the message store.
//!
//! Messages live at `<dir>/<sender>/<id>.mime`. Writes go through a
//! `.tmp_<id>.mime` sibling that is flushed, synced and renamed into place,
//! so a reader never sees a partial file. Temp files are skipped by scans
//! and removed when found at startup.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Envelope, MessageHandle};

pub(crate) const EXTENSION: &str = "mime";
pub(crate) const TEMP_PREFIX: &str = ".tmp_";
const ANONYMOUS_SENDER: &str = "anonymous";

/// Map a reverse path onto a single, safe directory name.
pub(crate) fn sender_directory(from: Option<&str>) -> String {
    let sanitized: String = from
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_' | '+') {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        ANONYMOUS_SENDER.to_string()
    } else {
        sanitized
    }
}

/// Durably write `bytes` to `<dir>/<id>.mime`.
pub(crate) async fn write_atomic(dir: &Path, id: Uuid, bytes: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;

    let temp_path = dir.join(format!("{TEMP_PREFIX}{id}.{EXTENSION}"));
    let final_path = dir.join(format!("{id}.{EXTENSION}"));

    let mut file = fs::File::create(&temp_path).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, &final_path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(final_path)
}

/// Remove a stored message. A file that is already gone counts as removed.
pub(crate) async fn remove(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete stored message");
            false
        }
    }
}

pub(crate) async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEMP_PREFIX))
}

fn is_message(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(EXTENSION)
}

/// Recursively list stored messages, oldest first.
///
/// Leftover temp files come from writes interrupted by a crash; they were
/// never acknowledged and are removed.
pub(crate) async fn scan(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir != root => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable store directory");
                continue;
            }
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !is_message(&path) {
                continue;
            }
            if is_temp(&path) {
                debug!(path = %path.display(), "Removing interrupted write");
                remove(&path).await;
                continue;
            }

            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, path));
        }
    }

    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Rebuild a handle for a file found on disk. The envelope comes from the
/// message headers since the SMTP envelope is not persisted.
pub(crate) async fn load_handle(path: &Path) -> io::Result<MessageHandle> {
    let bytes = fs::read(path).await?;
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("not a message id: {}", path.display()),
            )
        })?;

    Ok(MessageHandle {
        id,
        path: path.to_path_buf(),
        envelope: Envelope::from_headers(&bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_directory_is_a_single_component() {
        assert_eq!(sender_directory(Some("Alice@Example.com")), "alice@example.com");
        assert_eq!(sender_directory(Some("../../etc/passwd")), ".._.._etc_passwd");
        assert_eq!(sender_directory(Some("a/b\\c")), "a_b_c");
        assert_eq!(sender_directory(Some("..")), ANONYMOUS_SENDER);
        assert_eq!(sender_directory(Some("")), ANONYMOUS_SENDER);
        assert_eq!(sender_directory(None), ANONYMOUS_SENDER);
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let path = write_atomic(dir.path(), id, b"Subject: hi\r\n\r\nbody")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join(format!("{id}.mime")));
        assert_eq!(std::fs::read(&path).unwrap(), b"Subject: hi\r\n\r\nbody");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn scan_skips_and_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let sender = dir.path().join("alice@example.com");
        std::fs::create_dir_all(&sender).unwrap();

        let id = Uuid::new_v4();
        let kept = sender.join(format!("{id}.mime"));
        std::fs::write(&kept, b"x").unwrap();
        let temp = sender.join(format!(".tmp_{}.mime", Uuid::new_v4()));
        std::fs::write(&temp, b"partial").unwrap();
        std::fs::write(sender.join("notes.txt"), b"ignored").unwrap();

        let found = scan(dir.path()).await.unwrap();
        assert_eq!(found, vec![kept]);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn scan_orders_by_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join(format!("{}.mime", Uuid::new_v4()));
        let second = dir.path().join("nested").join(format!("{}.mime", Uuid::new_v4()));
        std::fs::create_dir_all(second.parent().unwrap()).unwrap();

        std::fs::write(&first, b"1").unwrap();
        let earlier = SystemTime::now() - std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&first)
            .unwrap()
            .set_modified(earlier)
            .unwrap();
        std::fs::write(&second, b"2").unwrap();

        assert_eq!(scan(dir.path()).await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove(&dir.path().join("gone.mime")).await);
    }

    #[tokio::test]
    async fn load_handle_reads_envelope_from_headers() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let path = dir.path().join(format!("{id}.mime"));
        std::fs::write(
            &path,
            "From: ops@example.com\r\nTo: a@example.com, b@example.com\r\nCc: c@example.com\r\nSubject: s\r\n\r\nbody\r\n",
        )
        .unwrap();

        let handle = load_handle(&path).await.unwrap();
        assert_eq!(handle.id, id);
        assert_eq!(handle.envelope.from.as_deref(), Some("ops@example.com"));
        assert_eq!(
            handle.envelope.to,
            vec!["a@example.com", "b@example.com", "c@example.com"]
        );
    }
}
