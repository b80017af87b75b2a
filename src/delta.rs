//! Reading whatever a file holds between the current cursor and EOF.

use std::io;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Bytes read by [`read_to_eof`], along with the file size seen at read time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delta {
    pub content: Vec<u8>,
    pub observed_size: u64,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Reads from the file's current position up to its size as of this call.
///
/// The file is left positioned just after the last byte returned. A short
/// read is not an error; the caller simply resumes from where it stopped on
/// the next call.
pub async fn read_to_eof(file: &mut File) -> io::Result<Delta> {
    let position = file.stream_position().await?;
    let observed_size = file.metadata().await?.len();
    let wanted = observed_size.saturating_sub(position);

    let mut content = Vec::with_capacity(wanted as usize);
    (&mut *file).take(wanted).read_to_end(&mut content).await?;

    if content.is_empty() {
        debug!(position, observed_size, "reading file returned no bytes");
    } else if (content.len() as u64) < wanted {
        debug!(position, wanted, read = content.len(), "short read");
    } else {
        trace!(position, read = content.len(), "read delta");
    }

    Ok(Delta {
        content,
        observed_size,
    })
}
