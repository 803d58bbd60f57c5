//! Running the toolkit inside somebody else's main loop
//!
//! There is no common main loop on Linux, so the toolkit supports three
//! ways of being driven:
//!
//! * its own blocking loop ([`Connection::event_loop`](crate::Connection::event_loop))
//! * polling [`Connection::process`](crate::Connection::process) periodically
//!   (more than ~50ms between calls is visible to the user)
//! * an [`Embed`] adapter: the host loop watches the X connection plus up to
//!   two extra descriptors and one one-shot timer, and calls `process`
//!   whenever any of them fires.

mod mio_embed;
mod tokio_embed;

pub use mio_embed::{MioEmbed, MioEmbedHandle};
pub use tokio_embed::{TokioEmbed, TokioEmbedHandle};

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

/// Hooks a host main loop exposes to the toolkit
///
/// The adapter is finalized by dropping it, which must remove every watch
/// and timer it registered. Whenever a watched descriptor is readable or the
/// timer expires the host must call `Connection::process`.
pub trait Embed {
    /// Start watching the X connection descriptor
    fn bind(&mut self, connection_fd: RawFd) -> io::Result<()>;

    /// Schedule the one-shot timer after about `delay`, or remove it with
    /// `None`. No precision is expected.
    fn set_timer(&mut self, delay: Option<Duration>) -> io::Result<()>;

    /// Start watching an extra descriptor for input
    fn watch(&mut self, fd: RawFd) -> io::Result<()>;

    /// Stop watching an extra descriptor
    fn unwatch(&mut self, fd: RawFd) -> io::Result<()>;
}

/// The installed adapter plus the timer deadline last advertised to it
#[derive(Default)]
pub(crate) struct EmbedSlot {
    adapter: Option<Box<dyn Embed>>,
    armed: Option<Instant>,
}

impl EmbedSlot {
    pub fn is_installed(&self) -> bool {
        self.adapter.is_some()
    }

    /// Replace the adapter; the previous one is dropped first
    pub fn install(
        &mut self,
        adapter: Option<Box<dyn Embed>>,
        connection_fd: RawFd,
        extra_fds: &[RawFd],
        next_deadline: Option<Instant>,
        now: Instant,
    ) -> Result<()> {
        self.clear();
        let Some(mut adapter) = adapter else {
            return Ok(());
        };

        adapter.bind(connection_fd).map_err(Error::Embed)?;
        for fd in extra_fds {
            adapter.watch(*fd).map_err(Error::Embed)?;
        }
        debug!("Embedding adapter bound to fd {} (+{} extra)", connection_fd, extra_fds.len());
        self.adapter = Some(adapter);
        self.arm(next_deadline, now)
    }

    pub fn clear(&mut self) {
        if self.adapter.take().is_some() {
            debug!("Embedding adapter finalized");
        }
        self.armed = None;
    }

    /// Advertise the next timer deadline if it changed
    ///
    /// A deadline that already passed counts as consumed: the adapter's
    /// one-shot timer has fired (or is about to), so it gets re-armed.
    pub fn arm(&mut self, next_deadline: Option<Instant>, now: Instant) -> Result<()> {
        let Some(adapter) = self.adapter.as_mut() else {
            return Ok(());
        };
        let still_pending = self.armed.is_none_or(|armed| armed > now);
        if self.armed == next_deadline && still_pending {
            return Ok(());
        }
        let delay = next_deadline.map(|deadline| deadline.saturating_duration_since(now));
        adapter.set_timer(delay).map_err(Error::Embed)?;
        self.armed = next_deadline;
        Ok(())
    }

    pub fn watch(&mut self, fd: RawFd) -> Result<()> {
        match self.adapter.as_mut() {
            Some(adapter) => adapter.watch(fd).map_err(Error::Embed),
            None => Ok(()),
        }
    }

    pub fn unwatch(&mut self, fd: RawFd) -> Result<()> {
        match self.adapter.as_mut() {
            Some(adapter) => adapter.unwatch(fd).map_err(Error::Embed),
            None => Ok(()),
        }
    }
}

/// Milliseconds for a host API, rounded up so a timer never fires early
pub fn delay_millis(delay: Duration) -> u64 {
    let ms = delay.as_millis();
    let ms = if Duration::from_millis(ms as u64) < delay { ms + 1 } else { ms };
    u64::try_from(ms).unwrap_or(u64::MAX)
}
