//! Embedding into a mio based loop
//!
//! Every descriptor the toolkit needs is registered in the host's
//! [`mio::Registry`] under a single token. The one-shot timer has no mio
//! counterpart, so its deadline is shared with a [`MioEmbedHandle`] that the
//! host uses as its poll timeout.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Registry, Token};
use tracing::{debug, warn};

use super::Embed;

/// [`Embed`] adapter registering descriptors in a mio registry
///
/// mio registrations are edge triggered: the host must call
/// `Connection::process` after every wakeup for the token, which drains the
/// X connection completely.
pub struct MioEmbed {
    registry: Registry,
    token: Token,
    fds: Vec<RawFd>,
    deadline: Rc<Cell<Option<Instant>>>,
}

/// Host side view of a [`MioEmbed`]
#[derive(Debug, Clone)]
pub struct MioEmbedHandle {
    token: Token,
    deadline: Rc<Cell<Option<Instant>>>,
}

impl MioEmbed {
    /// Create an adapter registering into `registry` under `token`
    pub fn new(registry: &Registry, token: Token) -> io::Result<(Self, MioEmbedHandle)> {
        let deadline = Rc::new(Cell::new(None));
        let embed = Self {
            registry: registry.try_clone()?,
            token,
            fds: Vec::new(),
            deadline: deadline.clone(),
        };
        Ok((embed, MioEmbedHandle { token, deadline }))
    }

    fn register(&mut self, fd: RawFd) -> io::Result<()> {
        if self.fds.contains(&fd) {
            return Ok(());
        }
        self.registry
            .register(&mut SourceFd(&fd), self.token, Interest::READABLE)?;
        self.fds.push(fd);
        debug!("mio: watching fd {}", fd);
        Ok(())
    }
}

impl Embed for MioEmbed {
    fn bind(&mut self, connection_fd: RawFd) -> io::Result<()> {
        self.register(connection_fd)
    }

    fn set_timer(&mut self, delay: Option<Duration>) -> io::Result<()> {
        self.deadline.set(delay.map(|d| crate::timer::deadline_after(Instant::now(), d)));
        Ok(())
    }

    fn watch(&mut self, fd: RawFd) -> io::Result<()> {
        self.register(fd)
    }

    fn unwatch(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(pos) = self.fds.iter().position(|f| *f == fd) {
            self.fds.remove(pos);
            self.registry.deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }
}

impl Drop for MioEmbed {
    fn drop(&mut self) {
        for fd in self.fds.drain(..) {
            if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                warn!("mio: failed to deregister fd {}: {:?}", fd, err);
            }
        }
        self.deadline.set(None);
    }
}

impl MioEmbedHandle {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Timeout for the host's `Poll::poll`, `None` when no timer is armed
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline
            .get()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// True once the armed timer expired
    pub fn timer_due(&self) -> bool {
        self.deadline.get().is_some_and(|d| d <= Instant::now())
    }

    /// Whether the host should call `Connection::process` after a poll
    ///
    /// Consumes an expired timer so it fires once.
    pub fn should_process(&self, events: &Events) -> bool {
        let readable = events.iter().any(|event| event.token() == self.token);
        let due = self.timer_due();
        if due {
            self.deadline.set(None);
        }
        readable || due
    }
}
