//! Where tailed content ends up.

use std::io::{self, Write};
use std::path::Path;

/// Receives display-ready chunks from file sessions.
///
/// Sessions call this concurrently; an implementation must keep each chunk
/// together.
pub trait Sink: Send + Sync {
    fn display(&self, source: &Path, chunk: &[u8]) -> io::Result<()>;
}

/// Writes to standard output, raw for a single file, or with every line
/// prefixed by the file's bold base name when following several.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink {
    labelled: bool,
}

impl StdoutSink {
    pub fn new(labelled: bool) -> Self {
        StdoutSink { labelled }
    }
}

impl Sink for StdoutSink {
    fn display(&self, source: &Path, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        if self.labelled {
            out.write_all(&label_lines(source, chunk))?;
        } else {
            out.write_all(chunk)?;
        }
        out.flush()
    }
}

/// Prefixes every line of `chunk` with the bold base name of `source`.
/// Leading and trailing newlines are dropped and each output line is
/// newline-terminated.
pub fn label_lines(source: &Path, chunk: &[u8]) -> Vec<u8> {
    let name = source
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_else(|| source.to_string_lossy());
    let label = format!("\x1b[1m{} => \x1b[0m ", name);

    let start = chunk.iter().position(|b| *b != b'\n');
    let end = chunk.iter().rposition(|b| *b != b'\n');
    let trimmed = match (start, end) {
        (Some(start), Some(end)) => &chunk[start..=end],
        _ => return Vec::new(),
    };

    let mut out = Vec::with_capacity(trimmed.len() + label.len() * 4);
    for line in trimmed.split(|b| *b == b'\n') {
        out.extend_from_slice(label.as_bytes());
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}
