//! Concatenation of chunk files into the final download.

use std::path::Path;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::chunk::part_file_path;
use super::error::DownloadError;

/// Merges `<final_path>.part0 .. .part<chunk_count-1>` into `final_path`.
///
/// Parent directories are created and the final file is truncated first.
/// Each chunk is streamed through a buffer of `buffer_size` bytes. After
/// copying, the final file size must equal the bytes written and, when
/// `expected_total` is known, the probed size. On a size mismatch the final
/// file is deleted.
///
/// Returns the number of bytes written. Chunk files are left in place; see
/// [`delete_part_files`].
///
/// # Errors
///
/// Returns `DownloadError` if the directory or final file cannot be created,
/// a chunk file is missing, a read or write fails, or verification fails.
#[instrument(skip(final_path), fields(path = %final_path.display()))]
pub async fn merge_chunks(
    final_path: &Path,
    chunk_count: usize,
    expected_total: Option<u64>,
    buffer_size: usize,
) -> Result<u64, DownloadError> {
    if let Some(parent) = final_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::create_dir(parent, e))?;
    }

    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(final_path)
        .await
        .map_err(|e| DownloadError::io(final_path, e))?;

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut written: u64 = 0;

    for index in 0..chunk_count {
        let part = part_file_path(final_path, index);
        let mut input = match File::open(&part).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::missing_chunk(part));
            }
            Err(e) => return Err(DownloadError::io(part, e)),
        };

        loop {
            let read = input
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::io(&part, e))?;
            if read == 0 {
                break;
            }
            let wrote = output
                .write(&buffer[..read])
                .await
                .map_err(|e| DownloadError::io(final_path, e))?;
            if wrote != read {
                return Err(DownloadError::partial_write(final_path, read, wrote));
            }
            written += read as u64;
        }
        debug!(chunk = index, written, "chunk appended");
    }

    output
        .flush()
        .await
        .map_err(|e| DownloadError::io(final_path, e))?;
    drop(output);

    let on_disk = fs::metadata(final_path)
        .await
        .map_err(|e| DownloadError::io(final_path, e))?
        .len();

    let expected = expected_total.unwrap_or(written);
    if on_disk != written || written != expected {
        warn!(on_disk, written, expected, "merged size mismatch, removing output");
        if let Err(e) = fs::remove_file(final_path).await {
            warn!(error = %e, "failed to remove mismatched output");
        }
        return Err(DownloadError::integrity(final_path, expected, on_disk));
    }

    Ok(written)
}

/// Deletes every chunk file of `final_path`; missing files are ignored.
pub async fn delete_part_files(final_path: &Path, chunk_count: usize) {
    for index in 0..chunk_count {
        let part = part_file_path(final_path, index);
        match fs::remove_file(&part).await {
            Ok(()) => debug!(path = %part.display(), "chunk file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %part.display(), error = %e, "failed to remove chunk file"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn write_parts(final_path: &Path, parts: &[&[u8]]) {
        for (i, data) in parts.iter().enumerate() {
            fs::write(part_file_path(final_path, i), data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_merge_concatenates_in_index_order() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.bin");
        write_parts(&final_path, &[b"hello ", b"chunked ", b"world"]).await;

        let written = merge_chunks(&final_path, 3, Some(19), 4).await.unwrap();

        assert_eq!(written, 19);
        assert_eq!(fs::read(&final_path).await.unwrap(), b"hello chunked world");
    }

    #[tokio::test]
    async fn test_merge_twice_does_not_double_append() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.bin");
        write_parts(&final_path, &[b"abc", b"def"]).await;

        merge_chunks(&final_path, 2, Some(6), 1024).await.unwrap();
        merge_chunks(&final_path, 2, Some(6), 1024).await.unwrap();

        assert_eq!(fs::read(&final_path).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_merge_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("a/b/out.bin");

        let result = merge_chunks(&final_path, 1, None, 1024).await;

        assert!(
            matches!(result, Err(DownloadError::MissingChunk { .. })),
            "got {result:?}"
        );
        assert!(
            final_path.parent().unwrap().is_dir(),
            "parent directories should exist"
        );
    }

    #[tokio::test]
    async fn test_merge_missing_chunk_fails() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.bin");
        write_parts(&final_path, &[b"only first"]).await;

        let result = merge_chunks(&final_path, 2, None, 1024).await;

        match result {
            Err(DownloadError::MissingChunk { path }) => {
                assert_eq!(path, part_file_path(&final_path, 1));
            }
            other => panic!("expected MissingChunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merge_size_mismatch_deletes_output() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.bin");
        write_parts(&final_path, &[b"12345"]).await;

        let result = merge_chunks(&final_path, 1, Some(10), 1024).await;

        assert!(
            matches!(
                result,
                Err(DownloadError::Integrity {
                    expected_bytes: 10,
                    actual_bytes: 5,
                    ..
                })
            ),
            "got {result:?}"
        );
        assert!(!final_path.exists(), "mismatched output must be removed");
    }

    #[tokio::test]
    async fn test_merge_unknown_total_accepts_written_size() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.bin");
        write_parts(&final_path, &[b"streamed body"]).await;

        let written = merge_chunks(&final_path, 1, None, 3).await.unwrap();
        assert_eq!(written, 13);
    }

    #[tokio::test]
    async fn test_delete_part_files_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.bin");
        write_parts(&final_path, &[b"a", b"b"]).await;

        delete_part_files(&final_path, 3).await;

        for i in 0..3 {
            assert!(!part_file_path(&final_path, i).exists());
        }
    }
}
