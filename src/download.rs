use std::path::{Path, PathBuf};

use futures_util::StreamExt as _;
use reqwest::Client;
use tokio::io::AsyncWriteExt as _;

use crate::error::{AppError, Result};

const PART_SUFFIX: &str = ".part";

/// Progress callback: bytes written so far, expected total if known.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

fn part_path_for(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(
        "{}.{}{}",
        file_name,
        uuid::Uuid::new_v4().simple(),
        PART_SUFFIX
    ))
}

/// Stream `url` into `dest`.
///
/// The body goes to a uniquely named `.part` file beside `dest` and is
/// renamed into place only after every byte has been written and synced,
/// so `dest` either does not exist or holds a complete download. The part
/// file is removed on any failure. Returns the number of bytes written.
pub async fn download_file(
    client: &Client,
    url: &str,
    dest: &Path,
    on_progress: ProgressFn<'_>,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::write(e.to_string()))?;
    }

    let part = part_path_for(dest);
    let result = stream_to_part(client, url, &part, on_progress).await;

    match result {
        Ok(written) => {
            if let Err(e) = tokio::fs::rename(&part, dest).await {
                discard_part(&part).await;
                return Err(AppError::write(format!("Failed to move download into place: {}", e)));
            }
            Ok(written)
        }
        Err(e) => {
            discard_part(&part).await;
            Err(e)
        }
    }
}

async fn stream_to_part(
    client: &Client,
    url: &str,
    part: &Path,
    on_progress: ProgressFn<'_>,
) -> Result<u64> {
    let resp = client
        .get(url)
        .header("User-Agent", "mineglance-desktop")
        .send()
        .await
        .map_err(|e| AppError::network_with_url(url, e.to_string()))?;

    if !resp.status().is_success() {
        return Err(AppError::network_with_url(url, resp.status().to_string()));
    }

    let total = resp.content_length();
    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(|e| AppError::write(e.to_string()))?;

    let mut written: u64 = 0;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::network_with_url(url, e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::write(e.to_string()))?;
        written += chunk.len() as u64;
        on_progress(written, total);
    }

    if let Some(expected) = total {
        if written != expected {
            return Err(AppError::network_with_url(
                url,
                format!("body truncated: {} of {} bytes", written, expected),
            ));
        }
    }

    file.flush().await.map_err(|e| AppError::write(e.to_string()))?;
    file.sync_all()
        .await
        .map_err(|e| AppError::write(e.to_string()))?;

    Ok(written)
}

async fn discard_part(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove partial download {:?}: {}", part, e);
        }
    }
}

/// Remove `.part` files left behind by an interrupted earlier run.
pub fn remove_stale_partials(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_part = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(PART_SUFFIX))
            .unwrap_or(false);
        if !is_part {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Failed to remove stale partial {:?}: {}", path, e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_files_are_unique_siblings() {
        let dest = Path::new("/tmp/updates/mineglance-2.0.0-setup.exe");
        let a = part_path_for(dest);
        let b = part_path_for(dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
        assert!(a.to_string_lossy().ends_with(PART_SUFFIX));
    }

    #[test]
    fn stale_partials_are_removed_and_artifacts_kept() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("mineglance-2.0.0-setup.exe");
        std::fs::write(&staged, b"installer").unwrap();
        std::fs::write(dir.path().join("mineglance-2.0.1-setup.exe.abc.part"), b"half").unwrap();

        assert_eq!(remove_stale_partials(dir.path()), 1);
        assert!(staged.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_dir_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(remove_stale_partials(&dir.path().join("missing")), 0);
    }
}
