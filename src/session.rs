//! The per-file follow loop.
//!
//! A [`FileSession`] owns one open file handle and one [`Watch`], and reacts
//! to the events of that watch:
//!
//! | Event              | Reaction                                                   |
//! |--------------------|------------------------------------------------------------|
//! | `MODIFIED`         | size grew: show the delta; shrank: show again from 0       |
//! | `MOVED`            | close, wait for the path to reappear, re-attach, catch up  |
//! | `ATTRIBUTE_CHANGED`| terminate if the path is gone *and* the inode is unlinked  |
//! | `DELETED`, `WATCH_INVALIDATED`, `UNMOUNTED` | terminate                         |
//!
//! Queue overflows and a lagging feed may have swallowed any of these, so they
//! trigger a resync: `MODIFIED` handling, which is idempotent up to the last
//! known size, followed by a check that the path still names the open inode.

use std::cmp::Ordering;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cursor;
use crate::delta::read_to_eof;
use crate::error::{Error, Result};
use crate::events::{EventMask, RawEvent};
use crate::feed::{FeedItem, WatchFeed};
use crate::rotation::{await_recreation, Recreation, RecreationBackoff};
use crate::sink::Sink;
use crate::watch::{Watch, WatchRegistry};

/// Lifecycle of a [`FileSession`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Following a live file.
    Active,
    /// The file was renamed away; waiting for its path to come back.
    AwaitingRecreation,
    /// Handle and watch released.
    Terminated,
}

/// Why a session stopped following its file without an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    /// The file was deleted.
    Deleted,
    /// The path vanished and the inode we hold has no links left.
    Unlinked,
    /// The kernel dropped the watch.
    Invalidated,
    /// The filesystem was unmounted.
    Unmounted,
    /// Shutdown was requested.
    Cancelled,
}

/// Follows one file. Mutated only by its own loop.
#[derive(Debug)]
pub struct FileSession {
    path: PathBuf,
    state: State,
    file: Option<File>,
    watch: Option<Watch>,
    feed: WatchFeed,
    registry: WatchRegistry,
    last_known_size: u64,
    cursor: u64,
    backoff: RecreationBackoff,
}

impl FileSession {
    /// Opens `path`, registers its watch, and shows its last `lines` lines.
    ///
    /// `events` must be subscribed before this is called so that no change
    /// made after the initial read is missed.
    pub async fn start(
        path: impl Into<PathBuf>,
        lines: usize,
        mut registry: WatchRegistry,
        events: broadcast::Receiver<RawEvent>,
        backoff: RecreationBackoff,
        sink: &dyn Sink,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).await.map_err(Error::open(&path))?;
        let watch = registry.register(&path)?;

        let mut session = FileSession {
            feed: WatchFeed::new(events, watch.id()),
            path,
            state: State::Active,
            file: Some(file),
            watch: Some(watch),
            registry,
            last_known_size: 0,
            cursor: 0,
            backoff,
        };

        // On error the session is dropped, which releases the watch.
        session.show_tail(lines, sink).await?;

        Ok(session)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Byte offset up to which content has been shown.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Runs until the file goes away, shutdown is requested, or an error
    /// occurs. The handle and watch are released before this returns.
    pub async fn run(mut self, sink: Arc<dyn Sink>, cancel: CancellationToken) -> Result<Exit> {
        let res = self.follow(sink.as_ref(), &cancel).await;
        self.release();

        match &res {
            Ok(exit) => info!(path = %self.path.display(), ?exit, "stopped following file"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "stopped following file"),
        }

        res
    }

    async fn follow(&mut self, sink: &dyn Sink, cancel: &CancellationToken) -> Result<Exit> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(path = %self.path.display(), "received notice to shutdown");
                    return Ok(Exit::Cancelled);
                }
                item = self.feed.next() => item,
            };

            let event = match item {
                Some(FeedItem::Event(event)) => event,
                Some(FeedItem::Missed(missed)) => {
                    warn!(path = %self.path.display(), missed, "fell behind on file events, resynchronizing");
                    if let Some(exit) = self.resync(sink, cancel).await? {
                        return Ok(exit);
                    }
                    continue;
                }
                None => return Err(Error::EventStreamClosed),
            };

            if let Some(exit) = self.handle(event, sink, cancel).await? {
                return Ok(exit);
            }
        }
    }

    async fn handle(
        &mut self,
        event: RawEvent,
        sink: &dyn Sink,
        cancel: &CancellationToken,
    ) -> Result<Option<Exit>> {
        let mask = event.mask;
        trace!(path = %self.path.display(), watch = %event.watch, ?mask, "handling event");

        if mask.contains(EventMask::UNMOUNTED) {
            debug!(path = %self.path.display(), "file system unmounted");
            return Ok(Some(Exit::Unmounted));
        }
        if mask.contains(EventMask::DELETED) {
            debug!(path = %self.path.display(), "file deleted");
            return Ok(Some(Exit::Deleted));
        }
        if mask.contains(EventMask::WATCH_INVALIDATED) {
            debug!(path = %self.path.display(), "watch invalidated");
            return Ok(Some(Exit::Invalidated));
        }

        if mask.contains(EventMask::OVERFLOW) {
            warn!(path = %self.path.display(), "kernel event queue overflowed, resynchronizing");
            return self.resync(sink, cancel).await;
        }
        if mask.contains(EventMask::MODIFIED) {
            self.on_modified(sink).await?;
        }
        if mask.contains(EventMask::ATTRIBUTE_CHANGED) && self.unlinked().await {
            debug!(path = %self.path.display(), "file unlinked");
            return Ok(Some(Exit::Unlinked));
        }
        if mask.contains(EventMask::MOVED) {
            return self.on_moved(sink, cancel).await;
        }

        Ok(None)
    }

    /// Growth shows the delta, truncation shows the file again from the
    /// start, and an unchanged size shows nothing.
    async fn on_modified(&mut self, sink: &dyn Sink) -> Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };
        let size = file
            .metadata()
            .await
            .map_err(Error::read(&self.path))?
            .len();

        match size.cmp(&self.last_known_size) {
            Ordering::Greater => {
                trace!(path = %self.path.display(), size, "file written");
            }
            Ordering::Less => {
                debug!(path = %self.path.display(), size, last = self.last_known_size, "file truncated");
                file.seek(SeekFrom::Start(0))
                    .await
                    .map_err(Error::read(&self.path))?;
                self.cursor = 0;
            }
            Ordering::Equal => return Ok(()),
        }

        self.show_delta(sink).await
    }

    /// Catches up after events may have been lost: shows any growth, then
    /// re-attaches if the path now names another inode (or nothing), and
    /// terminates if the open inode has been unlinked.
    async fn resync(&mut self, sink: &dyn Sink, cancel: &CancellationToken) -> Result<Option<Exit>> {
        self.on_modified(sink).await?;

        let held = match self.file.as_ref() {
            Some(file) => file.metadata().await.map_err(Error::read(&self.path))?,
            None => return Ok(None),
        };
        if held.nlink() == 0 {
            debug!(path = %self.path.display(), "file unlinked while events were lost");
            return Ok(Some(Exit::Unlinked));
        }

        match tokio::fs::metadata(&self.path).await {
            Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => Ok(None),
            _ => {
                debug!(path = %self.path.display(), "path no longer names the followed file");
                self.on_moved(sink, cancel).await
            }
        }
    }

    /// An attribute change on a path that no longer resolves is a deletion
    /// only once the open inode confirms it has no links left; otherwise an
    /// explicit event is awaited.
    async fn unlinked(&self) -> bool {
        if tokio::fs::metadata(&self.path).await.is_ok() {
            return false;
        }

        let file = match self.file.as_ref() {
            Some(file) => file,
            None => return true,
        };
        match file.metadata().await {
            Ok(meta) if meta.nlink() > 0 => {
                debug!(path = %self.path.display(), "path unresolvable but inode still linked");
                false
            }
            _ => true,
        }
    }

    /// Closes the rotated-away file, waits for a new one at the same path,
    /// swaps the watch over, and shows everything the new file holds.
    async fn on_moved(&mut self, sink: &dyn Sink, cancel: &CancellationToken) -> Result<Option<Exit>> {
        debug!(path = %self.path.display(), "file moved");
        self.file = None;
        self.state = State::AwaitingRecreation;

        let file = loop {
            if await_recreation(&self.path, self.backoff, cancel).await == Recreation::Cancelled {
                return Ok(Some(Exit::Cancelled));
            }
            match File::open(&self.path).await {
                Ok(file) => break file,
                // Gone again between the existence check and the open.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::open(&self.path)(e)),
            }
        };

        let watch = self.registry.register(&self.path)?;
        let new_id = watch.id();
        self.feed.retarget(new_id);
        if let Some(old) = self.watch.replace(watch) {
            // Re-linking the same inode hands back the same descriptor, which
            // must stay registered.
            if old.id() != new_id {
                self.registry.unregister(old);
            }
        }

        debug!(path = %self.path.display(), watch = %new_id, "file reappeared");
        self.file = Some(file);
        self.state = State::Active;
        self.cursor = 0;
        self.last_known_size = 0;
        self.show_delta(sink).await?;

        Ok(None)
    }

    async fn show_tail(&mut self, lines: usize, sink: &dyn Sink) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            self.cursor = cursor::seek_to_tail(file, lines)
                .await
                .map_err(Error::read(&self.path))?;
        }
        self.show_delta(sink).await
    }

    /// Shows everything from the cursor to the current end of the file.
    async fn show_delta(&mut self, sink: &dyn Sink) -> Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };
        let mut delta = read_to_eof(file).await.map_err(Error::read(&self.path))?;

        // Truncated after the size check that led here.
        if self.cursor > delta.observed_size {
            debug!(path = %self.path.display(), cursor = self.cursor, size = delta.observed_size, "file truncated");
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(Error::read(&self.path))?;
            self.cursor = 0;
            delta = read_to_eof(file).await.map_err(Error::read(&self.path))?;
        }

        if !delta.is_empty() {
            sink.display(&self.path, &delta.content)
                .map_err(Error::Output)?;
        }
        self.cursor += delta.content.len() as u64;
        self.last_known_size = delta.observed_size;

        Ok(())
    }

    fn release(&mut self) {
        self.file = None;
        if let Some(watch) = self.watch.take() {
            self.registry.unregister(watch);
        }
        self.state = State::Terminated;
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;
    use crate::watch::WatchId;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u8>>);

    impl Sink for Recorder {
        fn display(&self, _source: &Path, chunk: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }
    }

    impl Recorder {
        fn take(&self) -> String {
            String::from_utf8(std::mem::take(&mut *self.0.lock().unwrap())).unwrap()
        }
    }

    async fn started(path: &Path, lines: usize, sink: &Recorder) -> FileSession {
        let (source, registry) = EventSource::start(64).unwrap();
        FileSession::start(
            path,
            lines,
            registry,
            source.subscribe(),
            RecreationBackoff::default(),
            sink,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_shows_last_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("start.log");
        tokio::fs::write(&path, b"1\n2\n3\n4\n5\n6\n7\n").await.unwrap();

        let sink = Recorder::default();
        let session = started(&path, 3, &sink).await;

        assert_eq!(sink.take(), "5\n6\n7\n");
        assert_eq!(session.state(), State::Active);
        assert_eq!(session.cursor(), 14);
        assert_eq!(session.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_start_missing_file_fails() {
        let dir = tempdir().unwrap();
        let (source, registry) = EventSource::start(8).unwrap();
        let sink = Recorder::default();

        let res = FileSession::start(
            dir.path().join("absent.log"),
            5,
            registry,
            source.subscribe(),
            RecreationBackoff::default(),
            &sink,
        )
        .await;
        assert!(matches!(res, Err(Error::Open { .. })));
    }

    #[tokio::test]
    async fn test_modified_growth_and_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.log");
        tokio::fs::write(&path, b"a\n").await.unwrap();

        let sink = Recorder::default();
        let mut session = started(&path, 5, &sink).await;
        assert_eq!(sink.take(), "a\n");

        let mut writer = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        writer.write_all(b"b\nc\n").await.unwrap();
        writer.flush().await.unwrap();

        session.on_modified(&sink).await.unwrap();
        assert_eq!(sink.take(), "b\nc\n");
        assert_eq!(session.cursor(), 6);

        // Same size again: nothing shown.
        session.on_modified(&sink).await.unwrap();
        assert_eq!(sink.take(), "");

        tokio::fs::write(&path, b"new\n").await.unwrap();
        session.on_modified(&sink).await.unwrap();
        assert_eq!(sink.take(), "new\n");
        assert_eq!(session.cursor(), 4);
    }

    #[tokio::test]
    async fn test_terminal_events_end_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.log");
        tokio::fs::write(&path, b"").await.unwrap();

        let sink = Recorder::default();
        let cancel = CancellationToken::new();

        for (mask, exit) in [
            (EventMask::DELETED, Exit::Deleted),
            (EventMask::WATCH_INVALIDATED, Exit::Invalidated),
            (EventMask::UNMOUNTED | EventMask::WATCH_INVALIDATED, Exit::Unmounted),
        ] {
            let mut session = started(&path, 5, &sink).await;
            let event = RawEvent {
                watch: session.feed.watch(),
                mask,
                name_len: 0,
            };
            let res = session.handle(event, &sink, &cancel).await.unwrap();
            assert_eq!(res, Some(exit));
        }
    }

    #[tokio::test]
    async fn test_attribute_change_on_live_file_is_benign() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chmod.log");
        tokio::fs::write(&path, b"").await.unwrap();

        let sink = Recorder::default();
        let mut session = started(&path, 5, &sink).await;
        let event = RawEvent {
            watch: WatchId::new(0),
            mask: EventMask::ATTRIBUTE_CHANGED,
            name_len: 0,
        };
        let res = session
            .handle(event, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, None);
        assert!(!session.unlinked().await);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(session.unlinked().await);
    }

    #[tokio::test]
    async fn test_cancel_stops_run_and_releases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cancel.log");
        tokio::fs::write(&path, b"x\n").await.unwrap();

        let sink = Arc::new(Recorder::default());
        let session = started(&path, 5, &sink).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = timeout(Duration::from_secs(5), session.run(sink, cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, Exit::Cancelled);
    }

    #[tokio::test]
    async fn test_closed_event_stream_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("closed.log");
        tokio::fs::write(&path, b"").await.unwrap();

        let (tx, _) = broadcast::channel(4);
        let (_source, registry) = EventSource::start(4).unwrap();
        let sink = Arc::new(Recorder::default());
        let session = FileSession::start(
            &path,
            5,
            registry,
            tx.subscribe(),
            RecreationBackoff::default(),
            &*sink,
        )
        .await
        .unwrap();
        drop(tx);

        let res = timeout(
            Duration::from_secs(5),
            session.run(sink, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(res, Err(Error::EventStreamClosed)));
    }

    /// A session fed from `tx` instead of the live inotify queue.
    async fn started_on(
        path: &Path,
        tx: &broadcast::Sender<RawEvent>,
        sink: &Recorder,
    ) -> (FileSession, EventSource) {
        let (source, registry) = EventSource::start(8).unwrap();
        let session = FileSession::start(
            path,
            5,
            registry,
            tx.subscribe(),
            RecreationBackoff {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(200),
            },
            sink,
        )
        .await
        .unwrap();
        (session, source)
    }

    fn flood_other_watches(tx: &broadcast::Sender<RawEvent>, count: i32) {
        for raw in 0..count {
            tx.send(RawEvent {
                watch: WatchId::new(10_000 + raw),
                mask: EventMask::MODIFIED,
                name_len: 0,
            })
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_lagging_session_still_follows_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        tokio::fs::write(&path, b"old\n").await.unwrap();

        let (tx, _) = broadcast::channel(2);
        let sink = Arc::new(Recorder::default());
        let (session, _source) = started_on(&path, &tx, &sink).await;
        assert_eq!(sink.take(), "old\n");

        tokio::fs::rename(&path, dir.path().join("app.log.1")).await.unwrap();
        tokio::fs::write(&path, b"new\n").await.unwrap();

        // The move is pushed out of the channel before the session reads it.
        tx.send(RawEvent {
            watch: session.feed.watch(),
            mask: EventMask::MOVED,
            name_len: 0,
        })
        .unwrap();
        flood_other_watches(&tx, 4);

        let cancel = CancellationToken::new();
        let run = tokio::spawn(session.run(sink.clone(), cancel.clone()));

        let mut shown = String::new();
        let _ = timeout(Duration::from_secs(2), async {
            while shown != "new\n" {
                shown.push_str(&sink.take());
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert_eq!(shown, "new\n");

        cancel.cancel();
        let exit = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert_eq!(exit.unwrap(), Exit::Cancelled);
    }

    #[tokio::test]
    async fn test_lagging_session_notices_unlink() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doomed.log");
        tokio::fs::write(&path, b"").await.unwrap();

        let (tx, _) = broadcast::channel(2);
        let sink = Arc::new(Recorder::default());
        let (session, _source) = started_on(&path, &tx, &sink).await;

        tokio::fs::remove_file(&path).await.unwrap();
        flood_other_watches(&tx, 5);

        let exit = timeout(
            Duration::from_secs(5),
            session.run(sink, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit, Exit::Unlinked);
    }

    #[tokio::test]
    async fn test_moved_swaps_and_releases_watch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rotate.log");
        let rotated = dir.path().join("rotate.log.1");
        tokio::fs::write(&path, b"before\n").await.unwrap();

        let sink = Recorder::default();
        let mut session = started(&path, 5, &sink).await;
        assert_eq!(sink.take(), "before\n");
        let old_id = session.feed.watch();

        tokio::fs::rename(&path, &rotated).await.unwrap();
        tokio::fs::write(&path, b"after\n").await.unwrap();

        let res = session
            .on_moved(&sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, None);
        assert_eq!(session.state(), State::Active);
        assert_eq!(sink.take(), "after\n");

        let new_id = session.feed.watch();
        assert_ne!(new_id, old_id);
        assert_eq!(session.watch.as_ref().map(Watch::id), Some(new_id));

        // The old watch is gone, so the rotated inode gets a fresh one.
        let mut registry = session.registry.clone();
        let rewatched = registry.register(&rotated).unwrap();
        assert_ne!(rewatched.id(), old_id);
        assert_ne!(rewatched.id(), new_id);
        registry.unregister(rewatched);
    }

    #[tokio::test]
    async fn test_hard_linked_file_is_not_unlinked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linked.log");
        tokio::fs::write(&path, b"").await.unwrap();
        tokio::fs::hard_link(&path, dir.path().join("other.log"))
            .await
            .unwrap();

        let sink = Recorder::default();
        let mut session = started(&path, 5, &sink).await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(!session.unlinked().await);
        let event = RawEvent {
            watch: session.feed.watch(),
            mask: EventMask::ATTRIBUTE_CHANGED,
            name_len: 0,
        };
        let res = session
            .handle(event, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, None);
        assert_eq!(session.state(), State::Active);
    }

    #[tokio::test]
    async fn test_truncation_during_read_restarts_from_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shrink.log");
        tokio::fs::write(&path, b"abcdef").await.unwrap();

        let sink = Recorder::default();
        let mut session = started(&path, 5, &sink).await;
        assert_eq!(sink.take(), "abcdef");
        assert_eq!(session.cursor(), 6);

        // Shrunk after growth was detected but before the read.
        tokio::fs::write(&path, b"ab").await.unwrap();
        session.show_delta(&sink).await.unwrap();
        assert_eq!(sink.take(), "ab");
        assert_eq!(session.cursor(), 2);
        assert_eq!(session.last_known_size, 2);

        let mut writer = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        writer.write_all(b"cd").await.unwrap();
        writer.flush().await.unwrap();

        session.on_modified(&sink).await.unwrap();
        assert_eq!(sink.take(), "cd");
        assert_eq!(session.cursor(), 4);
    }
}
