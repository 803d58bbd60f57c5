//! Embedding into a tokio runtime
//!
//! Each watched descriptor gets a small task that waits for readiness with
//! [`AsyncFd`] and pokes a shared [`Notify`]. The host awaits
//! [`TokioEmbedHandle::wait`] and calls `Connection::process` afterwards.
//! `Connection` is not `Send`, so the host loop lives on a current-thread
//! runtime or in a `LocalSet`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Embed;

#[derive(Default)]
struct Shared {
    notify: Notify,
    deadline: Mutex<Option<Instant>>,
}

impl Shared {
    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }
}

/// [`Embed`] adapter backed by tokio readiness and timers
pub struct TokioEmbed {
    shared: Arc<Shared>,
    watchers: Vec<(RawFd, JoinHandle<()>)>,
}

/// Host side of a [`TokioEmbed`]
#[derive(Clone)]
pub struct TokioEmbedHandle {
    shared: Arc<Shared>,
}

impl TokioEmbed {
    pub fn new() -> (Self, TokioEmbedHandle) {
        let shared = Arc::new(Shared::default());
        let embed = Self {
            shared: shared.clone(),
            watchers: Vec::new(),
        };
        (embed, TokioEmbedHandle { shared })
    }

    fn spawn_watcher(&mut self, fd: RawFd) -> io::Result<()> {
        if self.watchers.iter().any(|(f, _)| *f == fd) {
            return Ok(());
        }
        // AsyncFd registers with the reactor of the current runtime
        tokio::runtime::Handle::try_current().map_err(io::Error::other)?;
        let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            loop {
                match async_fd.readable().await {
                    Ok(mut guard) => {
                        guard.clear_ready();
                        shared.notify.notify_one();
                    }
                    Err(err) => {
                        warn!("tokio: readiness wait on fd {} failed: {:?}", fd, err);
                        // wake the host so process() can report the broken descriptor
                        shared.notify.notify_one();
                        return;
                    }
                }
            }
        });
        debug!("tokio: watching fd {}", fd);
        self.watchers.push((fd, task));
        Ok(())
    }
}

impl Embed for TokioEmbed {
    fn bind(&mut self, connection_fd: RawFd) -> io::Result<()> {
        self.spawn_watcher(connection_fd)
    }

    fn set_timer(&mut self, delay: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let deadline = delay.map(|d| Instant::from_std(crate::timer::deadline_after(now.into_std(), d)));
        let previous = self.shared.deadline();
        self.shared.set_deadline(deadline);
        // a pending wait sleeps toward the old deadline; wake it to pick up an earlier one
        if let Some(deadline) = deadline {
            if previous.is_none_or(|previous| deadline < previous) {
                self.shared.notify.notify_one();
            }
        }
        Ok(())
    }

    fn watch(&mut self, fd: RawFd) -> io::Result<()> {
        self.spawn_watcher(fd)
    }

    fn unwatch(&mut self, fd: RawFd) -> io::Result<()> {
        self.watchers.retain(|(f, task)| {
            if *f == fd {
                task.abort();
            }
            *f != fd
        });
        Ok(())
    }
}

impl Drop for TokioEmbed {
    fn drop(&mut self) {
        for (_, task) in self.watchers.drain(..) {
            task.abort();
        }
        self.shared.set_deadline(None);
    }
}

impl TokioEmbedHandle {
    /// Wait until a watched descriptor is readable or the timer expires
    pub async fn wait(&self) {
        match self.shared.deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        // one-shot: only clear if nobody re-armed meanwhile
                        if self.shared.deadline() == Some(deadline) {
                            self.shared.set_deadline(None);
                        }
                    }
                }
            }
            None => self.shared.notify.notified().await,
        }
    }

    /// Time until the armed timer, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.shared
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[tokio::test]
    async fn test_timer_wakes_waiter_once() {
        let (mut embed, handle) = TokioEmbed::new();
        embed.set_timer(Some(Duration::from_millis(5))).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("timer should wake the waiter");
        assert_eq!(handle.timeout(), None);
    }

    #[tokio::test]
    async fn test_readable_descriptor_wakes_waiter() {
        let (mut embed, handle) = TokioEmbed::new();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        embed.bind(rx.as_raw_fd()).unwrap();

        tx.write_all(b"x").unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("readable fd should wake the waiter");
    }

    #[tokio::test]
    async fn test_earlier_timer_wakes_pending_waiter() {
        let (mut embed, handle) = TokioEmbed::new();
        embed.set_timer(Some(Duration::from_secs(60))).unwrap();

        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;

        embed.set_timer(Some(Duration::from_millis(5))).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("earlier deadline should end the wait")
            .unwrap();
    }

    #[test]
    fn test_huge_delay_is_clamped() {
        let (mut embed, handle) = TokioEmbed::new();
        embed.set_timer(Some(Duration::MAX)).unwrap();
        assert!(handle.timeout().is_some_and(|t| t > Duration::from_secs(3600)));
    }

    #[test]
    fn test_watch_needs_a_runtime() {
        let (mut embed, _handle) = TokioEmbed::new();
        let (_tx, rx) = UnixStream::pair().unwrap();
        assert!(embed.watch(rx.as_raw_fd()).is_err());
    }
}
