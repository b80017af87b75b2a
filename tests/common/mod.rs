#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tailf::{Follower, Options, RecreationBackoff, Sink};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const TIMEOUT_2_SEC: Duration = Duration::from_millis(2000);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub type Chunk = (PathBuf, Vec<u8>);

/// Forwards every displayed chunk to the test.
pub struct ChannelSink(mpsc::UnboundedSender<Chunk>);

impl Sink for ChannelSink {
    fn display(&self, source: &Path, chunk: &[u8]) -> std::io::Result<()> {
        let _ = self.0.send((source.to_path_buf(), chunk.to_vec()));
        Ok(())
    }
}

pub fn follower(lines: usize) -> (Follower, mpsc::UnboundedReceiver<Chunk>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = Options {
        lines,
        recreation: RecreationBackoff {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(200),
        },
        ..Options::default()
    };
    let follower = Follower::new(options, Arc::new(ChannelSink(tx))).unwrap();
    (follower, rx)
}

/// Collects chunks until their concatenation is `expected` long, then
/// returns it as a string. Panics if that takes too long.
pub async fn read_exactly(rx: &mut mpsc::UnboundedReceiver<Chunk>, expected: &str) -> String {
    let mut seen = Vec::new();
    while seen.len() < expected.len() {
        let (_, chunk) = timeout(TIMEOUT_2_SEC, rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("sink closed");
        seen.extend_from_slice(&chunk);
    }
    String::from_utf8(seen).unwrap()
}

/// Asserts nothing else is displayed for a little while.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Chunk>) {
    if let Ok(Some((path, chunk))) = timeout(QUIET_PERIOD, rx.recv()).await {
        panic!(
            "unexpected output from {}: {:?}",
            path.display(),
            String::from_utf8_lossy(&chunk)
        );
    }
}

pub fn append(path: &Path, content: &str) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
}
