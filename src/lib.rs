//! Follow one or more files as they grow, across rotation, truncation and
//! deletion.
//!
//! Changes are observed through a single inotify descriptor shared by every
//! followed file. A reader thread publishes each decoded event on a broadcast
//! channel, and one [`FileSession`] task per file picks out the events of its
//! own watch and reads whatever the file gained.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tailf::{Follower, Options, StdoutSink};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tailf::Error> {
//!     let sink = Arc::new(StdoutSink::new(true));
//!     let mut follower = Follower::new(Options::default(), sink)?;
//!
//!     // The last lines of each file are shown as it is added.
//!     follower.add_file("/var/log/syslog").await?;
//!     follower.add_file("/var/log/auth.log").await?;
//!
//!     for outcome in follower.run(CancellationToken::new()).await {
//!         println!("{}: {:?}", outcome.path.display(), outcome.result);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! While a rotated file is away, its path is polled (with backoff, and woken
//! early by a watch on the parent directory). Anything written to the new
//! file before it is re-opened is shown by the catch-up read that follows,
//! not as individual events.

pub mod cli;
mod cursor;
mod delta;
mod error;
mod events;
mod feed;
mod follower;
mod rotation;
mod session;
mod shutdown;
mod sink;
mod watch;

pub use cursor::{locate_start_offset, normalize_line_count, seek_to_tail, DEFAULT_LINE_COUNT};
pub use delta::{read_to_eof, Delta};
pub use error::{Error, Result};
pub use events::{EventMask, EventSource, RawEvent};
pub use feed::{FeedItem, WatchFeed};
pub use follower::{Follower, Options, Outcome};
pub use rotation::{await_recreation, Recreation, RecreationBackoff};
pub use session::{Exit, FileSession, State};
pub use shutdown::trap_signals;
pub use sink::{label_lines, Sink, StdoutSink};
pub use watch::{Watch, WatchId, WatchRegistry};
