//! Registration of per-file watches with inotify.

use std::fmt;
use std::path::{Path, PathBuf};

use inotify::{WatchDescriptor, WatchMask, Watches};
use tracing::debug;

use crate::error::{Error, Result};

/// Opaque identifier of a registered watch, as carried by every event.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WatchId(i32);

impl WatchId {
    /// Wraps a raw inotify watch descriptor number.
    pub const fn new(raw: i32) -> Self {
        WatchId(raw)
    }
}

impl From<&WatchDescriptor> for WatchId {
    fn from(wd: &WatchDescriptor) -> Self {
        WatchId(wd.get_watch_descriptor_id())
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live watch on one path. Owned by exactly one file session, and handed
/// back to [`WatchRegistry::unregister`] when that session is done with it.
#[derive(Debug)]
pub struct Watch {
    id: WatchId,
    descriptor: WatchDescriptor,
    path: PathBuf,
}

impl Watch {
    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

/// Handle for adding and removing watches on the shared inotify instance.
///
/// Cloning is cheap; each session keeps its own clone. Calls are independent
/// of one another, the kernel's watch table being the only shared state.
#[derive(Clone)]
pub struct WatchRegistry {
    watches: Watches,
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry").finish_non_exhaustive()
    }
}

impl WatchRegistry {
    pub(crate) fn new(watches: Watches) -> Self {
        WatchRegistry { watches }
    }

    /// Conditions a tailed file is watched for. Unmount and watch removal are
    /// always reported by the kernel and need no explicit interest.
    fn interest() -> WatchMask {
        WatchMask::MOVE_SELF | WatchMask::DELETE_SELF | WatchMask::ATTRIB | WatchMask::MODIFY
    }

    pub fn register(&mut self, path: impl AsRef<Path>) -> Result<Watch> {
        let path = path.as_ref();

        let descriptor = self
            .watches
            .add(path, Self::interest())
            .map_err(|source| Error::Register {
                path: path.to_path_buf(),
                source,
            })?;
        let id = WatchId::from(&descriptor);
        debug!(path = %path.display(), watch = %id, "added watch");

        Ok(Watch {
            id,
            descriptor,
            path: path.to_path_buf(),
        })
    }

    /// Removes a watch. Failure is only logged: the kernel drops watches on
    /// its own for deleted or unmounted files.
    pub fn unregister(&mut self, watch: Watch) {
        let Watch {
            id,
            descriptor,
            path,
        } = watch;

        match self.watches.remove(descriptor) {
            Ok(()) => debug!(path = %path.display(), watch = %id, "removed watch"),
            Err(e) => debug!(
                path = %path.display(),
                watch = %id,
                error = %e,
                "watch already gone"
            ),
        }
    }
}
