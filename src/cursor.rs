//! Locating the byte offset where the last N lines of a file begin.
//!
//! The scan walks backward from end-of-file in fixed-size chunks, counting
//! newlines. A final line without a trailing newline counts as a line, so the
//! content from the returned offset to EOF is always exactly the last
//! `min(count, lines)` lines.

use std::io::{self, SeekFrom};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, warn};

/// Number of lines shown when no (or a non-positive) count is requested.
pub const DEFAULT_LINE_COUNT: usize = 5;

const SCAN_CHUNK_LEN: usize = 4096;

/// Maps a requested line count to the one the engine works with.
pub fn normalize_line_count(requested: Option<i64>) -> usize {
    match requested {
        Some(count) if count > 0 => usize::try_from(count).unwrap_or(usize::MAX),
        _ => DEFAULT_LINE_COUNT,
    }
}

/// Returns the byte offset at which the last `line_count` lines of `file`
/// begin. The reader's position is unspecified afterwards.
pub async fn locate_start_offset<R>(file: &mut R, line_count: usize) -> io::Result<u64>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    scan(file, line_count, SCAN_CHUNK_LEN).await
}

/// Positions `file` at the start of its last `line_count` lines and returns
/// that offset.
///
/// If the scan fails the file is left at end-of-file instead, so nothing is
/// replayed.
pub async fn seek_to_tail<R>(file: &mut R, line_count: usize) -> io::Result<u64>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    match locate_start_offset(file, line_count).await {
        Ok(offset) => file.seek(SeekFrom::Start(offset)).await,
        Err(e) => {
            warn!(error = %e, "backward line scan failed, starting at end of file");
            file.seek(SeekFrom::End(0)).await
        }
    }
}

async fn scan<R>(file: &mut R, line_count: usize, chunk_len: usize) -> io::Result<u64>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let size = file.seek(SeekFrom::End(0)).await?;
    if size == 0 {
        debug!("file has no content to show");
        return Ok(0);
    }
    if line_count == 0 {
        return Ok(size);
    }

    let mut buf = vec![0u8; chunk_len.min(size as usize).max(1)];
    let mut wanted = None;
    let mut seen = 0;
    let mut end = size;

    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;

        // The boundary newline before the first shown line is one past the
        // count, unless the last line is unterminated.
        let wanted = *wanted.get_or_insert_with(|| match chunk.last() {
            Some(b'\n') => line_count + 1,
            _ => line_count,
        });

        for (idx, byte) in chunk.iter().enumerate().rev() {
            if *byte == b'\n' {
                seen += 1;
                if seen == wanted {
                    return Ok(start + idx as u64 + 1);
                }
            }
        }

        end = start;
    }

    Ok(0)
}
