//! Wiring the engine together: one event source, one session per file.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cursor::DEFAULT_LINE_COUNT;
use crate::error::{Error, Result};
use crate::events::EventSource;
use crate::rotation::RecreationBackoff;
use crate::session::{Exit, FileSession};
use crate::sink::Sink;
use crate::watch::WatchRegistry;

/// Engine tunables.
#[derive(Clone, Debug)]
pub struct Options {
    /// Lines shown from each file before following it.
    pub lines: usize,
    /// Existence poll bounds while a rotated file is away.
    pub recreation: RecreationBackoff,
    /// Events buffered per session before it is reported as lagging.
    pub event_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            lines: DEFAULT_LINE_COUNT,
            recreation: RecreationBackoff::default(),
            event_capacity: 1024,
        }
    }
}

/// How following one file ended.
#[derive(Debug)]
pub struct Outcome {
    pub path: PathBuf,
    pub result: Result<Exit>,
}

/// Follows a set of files until each one ends or shutdown is requested.
///
/// Files are added one at a time; each is shown (its last lines) as it is
/// added, and followed once [`run`](Follower::run) is called.
pub struct Follower {
    options: Options,
    source: EventSource,
    registry: WatchRegistry,
    sink: Arc<dyn Sink>,
    sessions: Vec<FileSession>,
}

impl std::fmt::Debug for Follower {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.debug_struct("Follower")
            .field("options", &self.options)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl Follower {
    /// Initializes file notifications. Fails if inotify is unavailable.
    pub fn new(options: Options, sink: Arc<dyn Sink>) -> Result<Self> {
        let (source, registry) = EventSource::start(options.event_capacity)?;

        Ok(Follower {
            options,
            source,
            registry,
            sink,
            sessions: Vec::new(),
        })
    }

    /// Opens and watches `path`, and shows its last lines.
    pub async fn add_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        debug!(path = %path.display(), "registering tailer");

        // Subscribe first so nothing after the initial read is missed.
        let events = self.source.subscribe();
        let session = FileSession::start(
            path,
            self.options.lines,
            self.registry.clone(),
            events,
            self.options.recreation,
            self.sink.as_ref(),
        )
        .await?;

        self.sessions.push(session);
        Ok(())
    }

    /// Follows every added file concurrently until all sessions have ended.
    ///
    /// Sessions stop individually when their file goes away or fails; a
    /// cancelled `shutdown` stops all of them.
    pub async fn run(self, shutdown: CancellationToken) -> Vec<Outcome> {
        let Follower {
            source,
            sink,
            sessions,
            ..
        } = self;
        // The reader thread becomes the last sender; if it dies, sessions
        // see the stream close instead of waiting forever.
        drop(source);

        let tasks = sessions.into_iter().map(|session| {
            let path = session.path().to_path_buf();
            let task = tokio::spawn(session.run(sink.clone(), shutdown.child_token()));
            async move {
                let result = task.await.unwrap_or_else(|e| {
                    error!(path = %path.display(), error = %e, "file session aborted");
                    Err(Error::Aborted(e))
                });
                Outcome { path, result }
            }
        });

        join_all(tasks).await
    }
}
