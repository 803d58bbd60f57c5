//! Event processing, timers, descriptor watches and embedding

use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};
use x11rb::connection::Connection as _;
use x11rb::protocol::Event;

use crate::connection::Connection;
use crate::embed::Embed;
use crate::error::Result;
use crate::handler::{self, WindowEvent};
use crate::timer::{self, TimerId};
use crate::window::{self, WindowId};

/// Milliseconds for `poll(2)`, rounded up and clamped; `None` blocks
fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        Some(timeout) => {
            let ms = crate::embed::delay_millis(timeout).min(u64::from(u16::MAX));
            PollTimeout::from(ms as u16)
        }
        None => PollTimeout::NONE,
    }
}

/// Descriptors from `fds` that have input, a hangup or an error pending
fn ready_fds(fds: &[RawFd], timeout: Option<Duration>) -> Result<Vec<RawFd>> {
    if fds.is_empty() {
        return Ok(Vec::new());
    }
    // The descriptors are owned by the caller for as long as they are watched
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
        .collect();
    match poll(&mut pollfds, poll_timeout(timeout)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    }
    let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(fds
        .iter()
        .zip(&pollfds)
        .filter(|(_, pfd)| pfd.revents().is_some_and(|r| r.intersects(wanted)))
        .map(|(fd, _)| *fd)
        .collect())
}

impl Connection {
    /// Handle everything that is pending right now
    ///
    /// Dispatches queued X events, runs callbacks of readable watched
    /// descriptors, fires due timers and re-arms the embedding adapter.
    /// Returns the time until the next timer, `None` when no timer is set.
    /// `Some(Duration::ZERO)` is a valid answer.
    pub fn process(&mut self) -> Result<Option<Duration>> {
        self.drain_events()?;
        self.service_watches()?;
        self.fire_timers();
        self.conn.flush()?;
        // timers, watch callbacks and the flush may have read events while
        // waiting on the socket; edge triggered hosts would not wake for them
        self.drain_events()?;

        let now = Instant::now();
        self.embed.arm(self.timers.next_deadline(), now)?;
        Ok(self.timers.delay_until_next(now))
    }

    /// Run until `exit` becomes true
    ///
    /// Blocks on the X connection and watched descriptors between rounds,
    /// never longer than the next timer or the idle wakeup. Without an exit
    /// flag only the currently pending work is processed.
    pub fn event_loop(&mut self, exit: Option<&AtomicBool>) -> Result<()> {
        let Some(exit) = exit else {
            self.process()?;
            return Ok(());
        };

        debug!("Entering event loop");
        while !exit.load(Ordering::Acquire) {
            let next = self.process()?;
            if exit.load(Ordering::Acquire) {
                break;
            }
            let wait = next.map_or(self.idle_wakeup, |next| next.min(self.idle_wakeup));
            let mut fds = vec![self.fd()];
            fds.extend(self.watches.fds());
            let ready = ready_fds(&fds, Some(wait))?;
            trace!("Event loop woke up, {} descriptor(s) ready", ready.len());
        }
        debug!("Event loop exited");
        Ok(())
    }

    /// Arm timer `id` to fire once after `delay`
    ///
    /// Setting an id that is already armed replaces it. The callback may
    /// re-arm its own id.
    pub fn set_timer<F>(&mut self, id: TimerId, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Connection, TimerId) + 'static,
    {
        let now = Instant::now();
        self.timers.set(id, timer::deadline_after(now, delay), Box::new(callback))?;
        trace!("Armed {} in {:?}", id, delay);
        self.embed.arm(self.timers.next_deadline(), now)
    }

    /// Disarm one timer; false when it was not armed
    pub fn cancel_timer(&mut self, id: TimerId) -> Result<bool> {
        let removed = self.timers.cancel(id);
        self.embed.arm(self.timers.next_deadline(), Instant::now())?;
        Ok(removed)
    }

    /// Disarm every timer, returning how many were armed
    pub fn cancel_all_timers(&mut self) -> Result<usize> {
        let removed = self.timers.clear();
        self.embed.arm(None, Instant::now())?;
        Ok(removed)
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains(id)
    }

    /// Time until the earliest timer
    pub fn next_timer(&self) -> Option<Duration> {
        self.timers.delay_until_next(Instant::now())
    }

    /// Run `callback` from `process` whenever `fd` is readable
    ///
    /// At most [`MAX_EXTRA_WATCHES`](crate::MAX_EXTRA_WATCHES) descriptors
    /// can be watched. The caller keeps `fd` open while it is watched.
    pub fn watch_fd<F>(&mut self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(&mut Connection, RawFd) + 'static,
    {
        if self.watches.add(fd, Box::new(callback))? {
            self.embed.watch(fd)?;
            debug!("Watching fd {}", fd);
        }
        Ok(())
    }

    /// Stop watching `fd`; false when it was not watched
    pub fn unwatch_fd(&mut self, fd: RawFd) -> Result<bool> {
        if !self.watches.remove(fd) {
            return Ok(false);
        }
        self.embed.unwatch(fd)?;
        debug!("Stopped watching fd {}", fd);
        Ok(true)
    }

    /// Hand event loop duties to a host main loop
    ///
    /// The previous adapter, if any, is dropped first. `None` only removes
    /// it. The new adapter is bound to the X connection, told about every
    /// watched descriptor and armed for the next timer.
    pub fn set_embed(&mut self, adapter: Option<Box<dyn Embed>>) -> Result<()> {
        let fd = self.fd();
        let extra = self.watches.fds();
        let next = self.timers.next_deadline();
        self.embed.install(adapter, fd, &extra, next, Instant::now())?;
        // requests queued before the host loop takes over must reach the server
        self.conn.flush()?;
        Ok(())
    }

    pub fn is_embedded(&self) -> bool {
        self.embed.is_installed()
    }

    fn drain_events(&mut self) -> Result<()> {
        while let Some(event) = self.conn.poll_for_event()? {
            self.dispatch_event(event);
        }
        Ok(())
    }

    /// Route one event to the handler chain of its window
    pub(crate) fn dispatch_event(&mut self, event: Event) {
        let Some(xid) = window::event_window(&event) else {
            trace!("Ignoring event without a window: {:?}", event);
            return;
        };
        let id = WindowId::from_xid(xid);
        let Some(state) = self.windows.get_mut(&id) else {
            return;
        };
        state.track(id, &event);
        handler::deliver(self, id, WindowEvent::Protocol(event));
    }

    fn service_watches(&mut self) -> Result<()> {
        if self.watches.is_empty() || self.watches.is_detached() {
            return Ok(());
        }
        let ready = ready_fds(&self.watches.fds(), Some(Duration::ZERO))?;
        if ready.is_empty() {
            return Ok(());
        }
        let mut running = self.watches.detach();
        running.run_ready(self, &ready);
        self.watches.reattach(running);
        Ok(())
    }

    fn fire_timers(&mut self) {
        for (id, callback) in self.timers.take_due(Instant::now()) {
            trace!("Firing {}", id);
            callback(self, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use x11rb::protocol::xproto::{AtomEnum, PropMode};
    use x11rb::wrapper::ConnectionExt as _;

    use crate::connection::ConnectFlags;
    use crate::geometry::Rect;
    use crate::handler::Propagation;

    #[test]
    fn test_poll_timeout_rounds_up_and_clamps() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), PollTimeout::ZERO);
        assert_eq!(poll_timeout(Some(Duration::from_micros(1_500))), PollTimeout::from(2u16));
        assert_eq!(poll_timeout(Some(Duration::from_secs(3600))), PollTimeout::from(u16::MAX));
    }

    #[test]
    fn test_ready_fds_reports_only_readable() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let (_idle_tx, idle_rx) = UnixStream::pair().unwrap();
        let fds = [rx.as_raw_fd(), idle_rx.as_raw_fd()];

        assert!(ready_fds(&fds, Some(Duration::ZERO)).unwrap().is_empty());
        tx.write_all(b"ping").unwrap();
        assert_eq!(ready_fds(&fds, Some(Duration::from_secs(5))).unwrap(), vec![rx.as_raw_fd()]);
    }

    #[test]
    fn test_hangup_counts_as_ready() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        assert_eq!(
            ready_fds(&[rx.as_raw_fd()], Some(Duration::ZERO)).unwrap(),
            vec![rx.as_raw_fd()]
        );
    }

    #[test]
    fn test_no_descriptors_never_blocks() {
        assert!(ready_fds(&[], None).unwrap().is_empty());
    }

    // The tests below talk to a real server and pass trivially without one

    fn live_connection(flags: ConnectFlags) -> Option<Connection> {
        Connection::connect(flags, None).ok()
    }

    /// Top-level window whose handler records every PropertyNotify
    fn watched_window(conn: &mut Connection) -> (WindowId, Rc<Cell<usize>>) {
        let screen = conn.default_screen();
        let top = conn.create_top_window(screen, None, Rect::sized(64, 64)).unwrap();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        conn.push_handler(top, move |_: &mut Connection, _: WindowId, event: &WindowEvent| {
            if let WindowEvent::Protocol(Event::PropertyNotify(_)) = event {
                counter.set(counter.get() + 1);
            }
            Propagation::Forward
        })
        .unwrap();
        conn.sync().unwrap();
        conn.process().unwrap();
        (top, seen)
    }

    fn touch_name(conn: &Connection, window: WindowId, name: &[u8]) {
        conn.xcb()
            .change_property8(PropMode::REPLACE, window.xid(), AtomEnum::WM_NAME, AtomEnum::STRING, name)
            .unwrap();
    }

    #[test]
    fn test_events_read_during_timer_callbacks_are_delivered() {
        let Some(mut conn) = live_connection(ConnectFlags::empty()) else {
            return;
        };
        let (top, seen) = watched_window(&mut conn);
        let before = seen.get();

        conn.set_timer(TimerId::new(1).unwrap(), Duration::ZERO, move |conn: &mut Connection, _: TimerId| {
            touch_name(conn, top, b"tick");
            // the round trip pulls the PropertyNotify into the event queue
            conn.sync().unwrap();
        })
        .unwrap();
        conn.process().unwrap();
        assert_eq!(seen.get(), before + 1);
    }

    #[test]
    fn test_events_read_by_xlib_reach_handlers() {
        let Some(mut conn) = live_connection(ConnectFlags::USE_GL) else {
            return;
        };
        let (top, seen) = watched_window(&mut conn);
        let before = seen.get();

        touch_name(&conn, top, b"xlib");
        conn.flush().unwrap();
        // an Xlib round trip reads the PropertyNotify off the socket
        conn.gl.as_ref().unwrap().sync();
        conn.process().unwrap();
        assert_eq!(seen.get(), before + 1);
    }
}
