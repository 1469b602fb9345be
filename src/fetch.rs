//! One-shot HTTP downloads and archive extraction.
//!
//! `download_to_file` streams a URL to a caller-chosen (temporary) path;
//! `extract` unpacks a finished archive into a destination directory.
//! Neither step renames anything into its final place: that is the caller's
//! job once both have succeeded.

use std::fs;
use std::path::{Component, Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::catalog::ExtractorKind;
use crate::error::{PluginError, Result};

/// Write buffer size, and the granularity of progress logging.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Download `url` into `dest`, reporting `(bytes_downloaded, total_bytes)` after
/// every received chunk. `total_bytes` is 0 when the server sends no length.
///
/// Any non-2xx status or mid-stream failure is a `Download` error; `dest` may be
/// left behind partially written.
pub async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    on_progress: impl Fn(u64, u64),
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| PluginError::download(url, format!("request failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(PluginError::download(url, format!("HTTP {}", resp.status())));
    }

    let total_size = resp.content_length().unwrap_or(0);
    tracing::info!(url, total_bytes = total_size, dest = %dest.display(), "downloading");

    let file = tokio::fs::File::create(dest).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(CHUNK_SIZE, file);
    let mut stream = resp.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut next_mark = CHUNK_SIZE as u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PluginError::download(url, format!("stream error: {e}")))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| PluginError::download(url, format!("write failed: {e}")))?;
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total_size);
        if downloaded >= next_mark {
            tracing::debug!(url, downloaded, total_bytes = total_size, "download progress");
            next_mark = (downloaded / CHUNK_SIZE as u64 + 1) * CHUNK_SIZE as u64;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| PluginError::download(url, format!("flush failed: {e}")))?;

    tracing::info!(url, bytes = downloaded, "download complete");
    Ok(downloaded)
}

/// Unpack `archive` into `destination`, creating it if needed.
/// Returns only after every entry has been written.
pub fn extract(kind: ExtractorKind, archive: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)?;
    match kind {
        ExtractorKind::Zip => extract_zip(archive, destination),
        ExtractorKind::TarBzip2 => extract_tar_bz2(archive, destination),
    }
}

/// Strip `.` components and reject anything that could land outside the
/// destination (absolute paths, `..`, drive prefixes).
fn normalize_archive_path(raw: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn extract_zip(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| PluginError::extraction(archive_path, e))?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| PluginError::extraction(archive_path, e))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(PluginError::extraction(
                archive_path,
                format!("unsafe archive entry: {}", entry.name()),
            ));
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| PluginError::extraction(archive_path, e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

fn extract_tar_bz2(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)?;
    let decoder = bzip2::read::BzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| PluginError::extraction(archive_path, e))?;
    for item in entries {
        let mut entry = item.map_err(|e| PluginError::extraction(archive_path, e))?;
        let raw_path = entry
            .path()
            .map_err(|e| PluginError::extraction(archive_path, e))?
            .into_owned();
        let Some(relative) = normalize_archive_path(&raw_path) else {
            return Err(PluginError::extraction(
                archive_path,
                format!("unsafe archive entry: {}", raw_path.display()),
            ));
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = destination.join(&relative);
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(PluginError::extraction(
                archive_path,
                format!("link entries are not supported: {}", relative.display()),
            ));
        }
        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| PluginError::extraction(archive_path, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Test archive builders, shared with the install tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::test_archives::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_strips_current_dir() {
        assert_eq!(
            normalize_archive_path(Path::new("./btop/bin/btop")),
            Some(PathBuf::from("btop/bin/btop"))
        );
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert!(normalize_archive_path(Path::new("../etc/passwd")).is_none());
        assert!(normalize_archive_path(Path::new("/etc/passwd")).is_none());
        assert!(normalize_archive_path(Path::new("a/../../b")).is_none());
    }

    #[test]
    fn extracts_zip_tree() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.zip");
        fs::write(
            &archive,
            zip_bytes(&[("btop4win/btop4win.exe", b"MZ"), ("btop4win/themes/x.theme", b"t")]),
        )
        .unwrap();
        let dest = dir.path().join("out");
        extract(ExtractorKind::Zip, &archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("btop4win/btop4win.exe")).unwrap(), b"MZ");
        assert!(dest.join("btop4win/themes/x.theme").is_file());
    }

    #[test]
    fn extracts_tar_bz2_tree() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.tbz");
        fs::write(
            &archive,
            tar_bz2_bytes(&[("btop/bin/btop", b"\x7fELF"), ("btop/themes/nord.theme", b"n")]),
        )
        .unwrap();
        let dest = dir.path().join("out");
        extract(ExtractorKind::TarBzip2, &archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("btop/bin/btop")).unwrap(), b"\x7fELF");
        assert!(dest.join("btop/themes/nord.theme").is_file());
    }

    #[test]
    fn corrupt_archive_is_an_extraction_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("junk.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();
        let err = extract(ExtractorKind::Zip, &archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, PluginError::Extraction { .. }));
    }

    #[test]
    fn wrong_format_is_an_extraction_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("really-a-zip.tbz");
        fs::write(&archive, zip_bytes(&[("a", b"a")])).unwrap();
        let err = extract(ExtractorKind::TarBzip2, &archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, PluginError::Extraction { .. }));
    }

    #[tokio::test]
    async fn download_writes_body_and_reports_progress() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![7u8; 4096];
        let mock = server
            .mock("GET", "/artifact.tbz")
            .with_status(200)
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.download");
        let last = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen = last.clone();
        let client = reqwest::Client::new();
        let n = download_to_file(
            &client,
            &format!("{}/artifact.tbz", server.url()),
            &dest,
            move |done, _total| seen.store(done, std::sync::atomic::Ordering::Relaxed),
        )
        .await
        .unwrap();

        assert_eq!(n, 4096);
        assert_eq!(last.load(std::sync::atomic::Ordering::Relaxed), 4096);
        assert_eq!(fs::read(&dest).unwrap(), body);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_download_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing.zip")
            .with_status(404)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("missing.download");
        let err = download_to_file(
            &reqwest::Client::new(),
            &format!("{}/missing.zip", server.url()),
            &dest,
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PluginError::Download { ref reason, .. } if reason.contains("404")));
        assert!(!dest.exists());
    }
}
