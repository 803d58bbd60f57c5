//! Extra file descriptors serviced by the event loop
//!
//! Besides the X connection the loop can watch a couple of caller supplied
//! descriptors (a wakeup eventfd, a pipe from an audio thread...). Their
//! callbacks run from `process` when the descriptor is readable.

use std::fmt;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Extra descriptors on top of the X connection's own
pub const MAX_EXTRA_WATCHES: usize = 2;

/// Called when a watched descriptor becomes readable
pub type WatchCallback<C> = Box<dyn FnMut(&mut C, RawFd)>;

/// Watched descriptors with their callbacks
///
/// Detaches while callbacks run, like a handler chain, so callbacks can
/// add or remove watches.
pub struct WatchList<C> {
    entries: Vec<(RawFd, WatchCallback<C>)>,
    detached: Option<Vec<RawFd>>,
    pending_removals: Vec<RawFd>,
}

impl<C> Default for WatchList<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            detached: None,
            pending_removals: Vec::new(),
        }
    }
}

impl<C> fmt::Debug for WatchList<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchList").field("fds", &self.fds()).finish()
    }
}

impl<C> WatchList<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd`; replaces the callback if it is already watched.
    /// Returns true when `fd` is new.
    pub fn add(&mut self, fd: RawFd, callback: WatchCallback<C>) -> Result<bool> {
        if let Some(entry) = self.entries.iter_mut().find(|(f, _)| *f == fd) {
            entry.1 = callback;
            return Ok(false);
        }
        let already = self.fds().contains(&fd);
        if !already && self.fds().len() >= MAX_EXTRA_WATCHES {
            return Err(Error::TooManyWatches(MAX_EXTRA_WATCHES));
        }
        self.pending_removals.retain(|f| *f != fd);
        self.entries.push((fd, callback));
        Ok(!already)
    }

    /// Stop watching `fd`; false when it was not watched
    pub fn remove(&mut self, fd: RawFd) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(f, _)| *f != fd);
        let mut removed = self.entries.len() != before;
        if let Some(running) = &self.detached {
            if running.contains(&fd) && !self.pending_removals.contains(&fd) {
                self.pending_removals.push(fd);
                removed = true;
            }
        }
        removed
    }

    /// Every watched descriptor, including ones whose callbacks are running
    pub fn fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .detached
            .iter()
            .flatten()
            .filter(|fd| !self.pending_removals.contains(fd))
            .copied()
            .collect();
        for (fd, _) in &self.entries {
            if !fds.contains(fd) {
                fds.push(*fd);
            }
        }
        fds
    }

    pub fn is_empty(&self) -> bool {
        self.fds().is_empty()
    }

    /// True while callbacks of this list are running
    pub fn is_detached(&self) -> bool {
        self.detached.is_some()
    }

    pub fn detach(&mut self) -> WatchList<C> {
        let entries = std::mem::take(&mut self.entries);
        self.detached = Some(entries.iter().map(|(fd, _)| *fd).collect());
        WatchList {
            entries,
            detached: None,
            pending_removals: Vec::new(),
        }
    }

    pub fn reattach(&mut self, mut list: WatchList<C>) {
        let removals = std::mem::take(&mut self.pending_removals);
        list.entries.retain(|(fd, _)| !removals.contains(fd));
        for (fd, callback) in self.entries.drain(..) {
            match list.entries.iter_mut().find(|(f, _)| *f == fd) {
                Some(entry) => entry.1 = callback,
                None => list.entries.push((fd, callback)),
            }
        }
        self.entries = list.entries;
        self.detached = None;
    }

    /// Run the callback of every descriptor in `ready`
    pub fn run_ready(&mut self, cx: &mut C, ready: &[RawFd]) {
        for (fd, callback) in self.entries.iter_mut() {
            if ready.contains(fd) {
                callback(cx, *fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(tag: u32) -> WatchCallback<Vec<(RawFd, u32)>> {
        Box::new(move |log: &mut Vec<(RawFd, u32)>, fd| log.push((fd, tag)))
    }

    #[test]
    fn test_limit_on_extra_descriptors() {
        let mut list = WatchList::new();
        assert!(list.add(10, push(1)).unwrap());
        assert!(list.add(11, push(2)).unwrap());
        assert!(matches!(list.add(12, push(3)), Err(Error::TooManyWatches(2))));
        // replacing an existing descriptor is fine at the limit
        assert!(!list.add(10, push(4)).unwrap());
        assert_eq!(list.fds(), vec![10, 11]);
    }

    #[test]
    fn test_only_ready_callbacks_run() {
        let mut list = WatchList::new();
        list.add(10, push(1)).unwrap();
        list.add(11, push(2)).unwrap();

        let mut log = Vec::new();
        list.run_ready(&mut log, &[11]);
        assert_eq!(log, vec![(11, 2)]);
    }

    #[test]
    fn test_changes_while_detached_are_merged() {
        let mut list = WatchList::new();
        list.add(10, push(1)).unwrap();
        list.add(11, push(2)).unwrap();

        let running = list.detach();
        assert_eq!(list.fds(), vec![10, 11]);
        assert!(list.remove(10));
        assert_eq!(list.fds(), vec![11]);
        assert!(list.add(12, push(3)).unwrap());
        assert!(matches!(list.add(13, push(4)), Err(Error::TooManyWatches(_))));
        list.reattach(running);

        assert_eq!(list.fds(), vec![11, 12]);
        let mut log = Vec::new();
        list.run_ready(&mut log, &[10, 11, 12]);
        assert_eq!(log, vec![(11, 2), (12, 3)]);
    }

    #[test]
    fn test_remove_unknown() {
        let mut list: WatchList<Vec<(RawFd, u32)>> = WatchList::new();
        assert!(!list.remove(3));
        assert!(list.is_empty());
    }
}
