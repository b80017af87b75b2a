//! Decoding inotify records and publishing them to every file session.
//!
//! A single [`EventSource`] owns the inotify descriptor. Its reader thread
//! blocks on the descriptor, decodes each queued record into a [`RawEvent`]
//! and publishes it, in kernel order, on a broadcast channel that every
//! session subscribes to. Sessions filter by watch id (see
//! [`WatchFeed`](crate::feed::WatchFeed)); one descriptor serves all files.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::thread;

use inotify::Inotify;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::watch::{WatchId, WatchRegistry};

/// Room for this many records carrying a maximal file name per read.
const QUEUED_EVENTS_PER_READ: usize = 10;
const EVENT_RECORD_LEN: usize = 16 + 255 + 1;
const EVENT_BUFFER_LEN: usize = QUEUED_EVENTS_PER_READ * EVENT_RECORD_LEN;

/// The set of conditions reported by one event.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct EventMask(u8);

impl EventMask {
    /// The watched file was renamed.
    pub const MOVED: EventMask = EventMask(1 << 0);
    /// The watched file was written to or truncated.
    pub const MODIFIED: EventMask = EventMask(1 << 1);
    /// Metadata changed, including the link count dropping on unlink.
    pub const ATTRIBUTE_CHANGED: EventMask = EventMask(1 << 2);
    /// The watched file was deleted and no longer held open.
    pub const DELETED: EventMask = EventMask(1 << 3);
    /// The kernel removed the watch.
    pub const WATCH_INVALIDATED: EventMask = EventMask(1 << 4);
    /// The filesystem holding the file was unmounted.
    pub const UNMOUNTED: EventMask = EventMask(1 << 5);
    /// The kernel event queue overflowed and events were dropped.
    pub const OVERFLOW: EventMask = EventMask(1 << 6);

    const NAMES: [(EventMask, &'static str); 7] = [
        (Self::MOVED, "MOVED"),
        (Self::MODIFIED, "MODIFIED"),
        (Self::ATTRIBUTE_CHANGED, "ATTRIBUTE_CHANGED"),
        (Self::DELETED, "DELETED"),
        (Self::WATCH_INVALIDATED, "WATCH_INVALIDATED"),
        (Self::UNMOUNTED, "UNMOUNTED"),
        (Self::OVERFLOW, "OVERFLOW"),
    ];

    pub const fn empty() -> Self {
        EventMask(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether any of the conditions in `other` are set.
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether all of the conditions in `other` are set.
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

impl From<inotify::EventMask> for EventMask {
    fn from(raw: inotify::EventMask) -> Self {
        use inotify::EventMask as In;

        let table = [
            (In::MOVE_SELF, EventMask::MOVED),
            (In::MODIFY, EventMask::MODIFIED),
            (In::ATTRIB, EventMask::ATTRIBUTE_CHANGED),
            (In::DELETE_SELF, EventMask::DELETED),
            (In::IGNORED, EventMask::WATCH_INVALIDATED),
            (In::UNMOUNT, EventMask::UNMOUNTED),
            (In::Q_OVERFLOW, EventMask::OVERFLOW),
        ];

        table
            .into_iter()
            .filter(|(bit, _)| raw.contains(*bit))
            .fold(EventMask::empty(), |mask, (_, flag)| mask | flag)
    }
}

/// One decoded notification record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawEvent {
    pub watch: WatchId,
    pub mask: EventMask,
    /// Length of the trailing name; always zero for watches on files.
    pub name_len: usize,
}

impl<S: AsRef<std::ffi::OsStr>> From<inotify::Event<S>> for RawEvent {
    fn from(event: inotify::Event<S>) -> Self {
        RawEvent {
            watch: WatchId::from(&event.wd),
            mask: event.mask.into(),
            name_len: event.name.map(|name| name.as_ref().len()).unwrap_or(0),
        }
    }
}

/// Owner of the notification descriptor and its broadcast channel.
///
/// Dropping the `EventSource` leaves the reader thread as the only sender,
/// so sessions observe a closed stream if that thread ever stops.
#[derive(Debug)]
pub struct EventSource {
    sender: broadcast::Sender<RawEvent>,
}

impl EventSource {
    /// Initializes inotify and starts the reader thread.
    pub fn start(capacity: usize) -> Result<(EventSource, WatchRegistry)> {
        let inotify = Inotify::init().map_err(Error::NotifyInit)?;
        let registry = WatchRegistry::new(inotify.watches());
        let (sender, _) = broadcast::channel(capacity);

        let producer_sender = sender.clone();
        thread::Builder::new()
            .name("tailf-events".into())
            .spawn(move || produce(inotify, producer_sender))
            .map_err(Error::NotifyInit)?;

        Ok((EventSource { sender }, registry))
    }

    /// Returns a receiver seeing every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RawEvent> {
        self.sender.subscribe()
    }
}

/// Reader loop. Blocks on the descriptor for the life of the process, or
/// until a read fails or nobody is listening anymore.
fn produce(mut inotify: Inotify, sender: broadcast::Sender<RawEvent>) {
    let mut buffer = [0u8; EVENT_BUFFER_LEN];

    loop {
        trace!("reading inotify event list");
        let events = match inotify.read_events_blocking(&mut buffer) {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "error while reading inotify events, no further file changes will be seen");
                return;
            }
        };

        let mut decoded = 0;
        for event in events {
            decoded += 1;
            let event = RawEvent::from(event);
            trace!(watch = %event.watch, mask = ?event.mask, "read inotify event");

            if sender.send(event).is_err() {
                debug!("no file sessions left, stopping event reader");
                return;
            }
        }

        if decoded == 0 {
            warn!("inotify read returned no events");
        }
    }
}
