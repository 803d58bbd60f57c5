//! Per-window event handler chains
//!
//! A window carries an ordered list of handlers. The newest handler sees an
//! event first and either consumes it or forwards it to the one installed
//! before it. `WindowEvent::Destroying` is delivered to every handler no
//! matter what they return.
//!
//! While a chain dispatches it is detached from its window so handlers can
//! get `&mut` access to the connection. Handlers pushed or removed in the
//! meantime are merged back on reattach, and events for the window that
//! show up meanwhile are queued behind the running one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use x11rb::protocol::Event;

use crate::window::WindowId;

/// Event delivered to a window handler
#[derive(Debug, Clone)]
pub enum WindowEvent {
    /// Event read from the X server
    Protocol(Event),
    /// The window is being torn down; its XID may already be gone on the
    /// server. Every handler receives this exactly once.
    Destroying,
}

/// What a handler did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Consumed, older handlers do not see it
    Stop,
    /// Pass to the previously installed handler
    Forward,
}

/// Something that reacts to window events
pub trait WindowHandler<C> {
    fn handle(&mut self, cx: &mut C, window: WindowId, event: &WindowEvent) -> Propagation;
}

impl<C, F> WindowHandler<C> for F
where
    F: FnMut(&mut C, WindowId, &WindowEvent) -> Propagation,
{
    fn handle(&mut self, cx: &mut C, window: WindowId, event: &WindowEvent) -> Propagation {
        self(cx, window, event)
    }
}

/// Identifies an installed handler for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered handlers of one window, oldest first
pub struct HandlerChain<C> {
    entries: Vec<(HandlerId, Box<dyn WindowHandler<C>>)>,
    // ids of the handlers taken out by a running dispatch
    running: Option<Vec<HandlerId>>,
    pending_removals: Vec<HandlerId>,
    // events that arrived while the chain was dispatching
    deferred: VecDeque<WindowEvent>,
}

impl<C> Default for HandlerChain<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            running: None,
            pending_removals: Vec::new(),
            deferred: VecDeque::new(),
        }
    }
}

impl<C> fmt::Debug for HandlerChain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.entries.iter().map(|(id, _)| *id).collect::<Vec<_>>())
            .field("running", &self.running)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl<C> HandlerChain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler on top of the chain
    pub fn push(&mut self, handler: Box<dyn WindowHandler<C>>) -> HandlerId {
        let id = HandlerId::next();
        self.entries.push((id, handler));
        id
    }

    /// Uninstall a handler
    ///
    /// Removing a handler that belongs to a running dispatch is deferred
    /// until the chain is reattached. Returns false for ids that are not
    /// installed.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|(h, _)| *h == id) {
            self.entries.remove(pos);
            return true;
        }
        let running = self.running.as_ref().is_some_and(|ids| ids.contains(&id));
        if running && !self.pending_removals.contains(&id) {
            self.pending_removals.push(id);
            return true;
        }
        false
    }

    /// Installed handlers, including the ones of a running dispatch
    pub fn len(&self) -> usize {
        let running = self.running.as_ref().map_or(0, |ids| ids.len());
        self.entries.len() + running - self.pending_removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_detached(&self) -> bool {
        self.running.is_some()
    }

    /// Take the handlers out for dispatching, leaving an empty detached chain
    pub fn detach(&mut self) -> HandlerChain<C> {
        let entries = std::mem::take(&mut self.entries);
        self.running = Some(entries.iter().map(|(id, _)| *id).collect());
        HandlerChain {
            entries,
            ..HandlerChain::default()
        }
    }

    /// Put dispatched handlers back, applying changes made meanwhile
    pub fn reattach(&mut self, mut chain: HandlerChain<C>) {
        self.discard_removed(&mut chain);
        self.running = None;
        chain.entries.append(&mut self.entries);
        self.entries = chain.entries;
    }

    /// Drop the handlers of `running` that were removed while it was out
    pub fn discard_removed(&mut self, running: &mut HandlerChain<C>) {
        let removals = std::mem::take(&mut self.pending_removals);
        running.entries.retain(|(id, _)| !removals.contains(id));
    }

    /// Queue an event for delivery once the running dispatch is done
    pub fn defer(&mut self, event: WindowEvent) {
        self.deferred.push_back(event);
    }

    pub fn next_deferred(&mut self) -> Option<WindowEvent> {
        self.deferred.pop_front()
    }

    /// Run the chain newest first; true if some handler consumed the event
    pub fn dispatch(&mut self, cx: &mut C, window: WindowId, event: &WindowEvent) -> bool {
        let destroying = matches!(event, WindowEvent::Destroying);
        for (_, handler) in self.entries.iter_mut().rev() {
            let result = handler.handle(cx, window, event);
            if result == Propagation::Stop && !destroying {
                return true;
            }
        }
        destroying
    }
}

/// Owner of the handler chains, reachable from inside handlers
pub(crate) trait ChainStore: Sized {
    fn chain_mut(&mut self, window: WindowId) -> Option<&mut HandlerChain<Self>>;

    /// Keep the chain of a window torn down mid-dispatch for the dispatcher
    fn store_orphan(&mut self, window: WindowId, chain: HandlerChain<Self>);

    fn take_orphan(&mut self, window: WindowId) -> Option<HandlerChain<Self>>;
}

/// Deliver `event` to the chain of `window`
///
/// An event for a window whose chain is already dispatching (a handler
/// waiting on the server, say) is queued and delivered right after the
/// running dispatch returns. When a handler tears the window down, the
/// handlers of the running dispatch get `Destroying` here, minus the ones
/// removed meanwhile.
pub(crate) fn deliver<C: ChainStore>(cx: &mut C, window: WindowId, event: WindowEvent) {
    let Some(slot) = cx.chain_mut(window) else {
        return;
    };
    if slot.is_detached() {
        slot.defer(event);
        return;
    }

    let mut next = Some(event);
    while let Some(event) = next.take() {
        let Some(slot) = cx.chain_mut(window) else {
            return;
        };
        let mut running = slot.detach();
        running.dispatch(cx, window, &event);

        match cx.chain_mut(window) {
            Some(slot) => {
                slot.reattach(running);
                next = slot.next_deferred();
            }
            None => {
                if let Some(mut orphan) = cx.take_orphan(window) {
                    orphan.discard_removed(&mut running);
                }
                running.dispatch(cx, window, &WindowEvent::Destroying);
            }
        }
    }
}

/// Tell every handler of a chain that was just taken off its window
pub(crate) fn retire<C: ChainStore>(cx: &mut C, window: WindowId, mut chain: HandlerChain<C>) {
    chain.dispatch(cx, window, &WindowEvent::Destroying);
    if chain.is_detached() {
        cx.store_orphan(window, chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use x11rb::protocol::xproto::{
        MAP_NOTIFY_EVENT, MapNotifyEvent, UNMAP_NOTIFY_EVENT, UnmapNotifyEvent,
    };

    type Log = Vec<&'static str>;

    fn named(name: &'static str, result: Propagation) -> Box<dyn WindowHandler<Log>> {
        Box::new(move |log: &mut Log, _: WindowId, _: &WindowEvent| {
            log.push(name);
            result
        })
    }

    fn map_event() -> WindowEvent {
        WindowEvent::Protocol(Event::MapNotify(MapNotifyEvent {
            response_type: MAP_NOTIFY_EVENT,
            sequence: 0,
            event: 0x40,
            window: 0x40,
            override_redirect: false,
        }))
    }

    #[test]
    fn test_newest_handler_runs_first_and_can_stop() {
        let mut chain = HandlerChain::new();
        chain.push(named("base", Propagation::Stop));
        chain.push(named("overlay", Propagation::Stop));

        let mut log = Log::new();
        assert!(chain.dispatch(&mut log, WindowId::from_xid(0x40), &map_event()));
        assert_eq!(log, ["overlay"]);
    }

    #[test]
    fn test_forward_reaches_previous_handler() {
        let mut chain = HandlerChain::new();
        chain.push(named("base", Propagation::Forward));
        chain.push(named("overlay", Propagation::Forward));

        let mut log = Log::new();
        assert!(!chain.dispatch(&mut log, WindowId::from_xid(0x40), &map_event()));
        assert_eq!(log, ["overlay", "base"]);
    }

    #[test]
    fn test_destroying_reaches_every_handler() {
        let mut chain = HandlerChain::new();
        chain.push(named("base", Propagation::Stop));
        chain.push(named("overlay", Propagation::Stop));

        let mut log = Log::new();
        assert!(chain.dispatch(&mut log, WindowId::from_xid(0x40), &WindowEvent::Destroying));
        assert_eq!(log, ["overlay", "base"]);
    }

    #[test]
    fn test_remove_restores_previous_top() {
        let mut chain = HandlerChain::new();
        chain.push(named("base", Propagation::Stop));
        let overlay = chain.push(named("overlay", Propagation::Stop));
        assert!(chain.remove(overlay));
        assert!(!chain.remove(overlay));

        let mut log = Log::new();
        chain.dispatch(&mut log, WindowId::from_xid(0x40), &map_event());
        assert_eq!(log, ["base"]);
    }

    #[test]
    fn test_changes_while_detached_are_merged() {
        let mut slot = HandlerChain::new();
        let base = slot.push(named("base", Propagation::Forward));
        slot.push(named("mid", Propagation::Forward));

        let running = slot.detach();
        assert!(slot.is_detached());
        // handlers out for dispatch still count as installed
        assert_eq!(slot.len(), 2);

        // A handler removes an older one and installs a new one mid-dispatch
        assert!(slot.remove(base));
        slot.push(named("late", Propagation::Forward));
        slot.reattach(running);
        assert!(!slot.is_detached());
        assert_eq!(slot.len(), 2);

        let mut log = Log::new();
        slot.dispatch(&mut log, WindowId::from_xid(0x40), &map_event());
        assert_eq!(log, ["late", "mid"]);
    }

    #[test]
    fn test_remove_while_detached_checks_running_ids() {
        let mut slot: HandlerChain<Log> = HandlerChain::new();
        let base = slot.push(named("base", Propagation::Forward));
        let mut other: HandlerChain<Log> = HandlerChain::new();
        let stranger = other.push(named("stranger", Propagation::Forward));

        let running = slot.detach();
        assert_eq!(slot.len(), 1);
        assert!(!slot.remove(stranger));
        assert!(slot.remove(base));
        assert!(!slot.remove(base));
        assert_eq!(slot.len(), 0);
        slot.reattach(running);
        assert!(slot.is_empty());
    }

    /// Windows with their chains plus a log, standing in for a connection
    #[derive(Default)]
    struct Desk {
        chains: HashMap<WindowId, HandlerChain<Desk>>,
        orphans: HashMap<WindowId, HandlerChain<Desk>>,
        log: Vec<String>,
    }

    impl ChainStore for Desk {
        fn chain_mut(&mut self, window: WindowId) -> Option<&mut HandlerChain<Self>> {
            self.chains.get_mut(&window)
        }

        fn store_orphan(&mut self, window: WindowId, chain: HandlerChain<Self>) {
            self.orphans.insert(window, chain);
        }

        fn take_orphan(&mut self, window: WindowId) -> Option<HandlerChain<Self>> {
            self.orphans.remove(&window)
        }
    }

    fn kind(event: &WindowEvent) -> &'static str {
        match event {
            WindowEvent::Protocol(Event::MapNotify(_)) => "map",
            WindowEvent::Protocol(Event::UnmapNotify(_)) => "unmap",
            WindowEvent::Protocol(_) => "other",
            WindowEvent::Destroying => "destroying",
        }
    }

    fn unmap_event() -> WindowEvent {
        WindowEvent::Protocol(Event::UnmapNotify(UnmapNotifyEvent {
            response_type: UNMAP_NOTIFY_EVENT,
            sequence: 0,
            event: 0x40,
            window: 0x40,
            from_configure: false,
        }))
    }

    #[test]
    fn test_event_during_dispatch_reaches_handlers() {
        let window = WindowId::from_xid(0x40);
        let mut desk = Desk::default();
        let mut chain = HandlerChain::new();
        chain.push(Box::new(|desk: &mut Desk, window: WindowId, event: &WindowEvent| {
            desk.log.push(format!("app:{}", kind(event)));
            if kind(event) == "map" {
                // a blocking call inside the handler reads the next event
                deliver(desk, window, unmap_event());
                desk.log.push("app:returned".into());
            }
            Propagation::Stop
        }) as Box<dyn WindowHandler<Desk>>);
        desk.chains.insert(window, chain);

        deliver(&mut desk, window, map_event());
        assert_eq!(desk.log, ["app:map", "app:returned", "app:unmap"]);
        assert!(!desk.chains[&window].is_detached());
    }

    #[test]
    fn test_removed_handler_misses_destroying_after_teardown() {
        let window = WindowId::from_xid(0x40);
        let mut desk = Desk::default();
        let mut chain = HandlerChain::new();
        let old = chain.push(Box::new(|desk: &mut Desk, _: WindowId, event: &WindowEvent| {
            desk.log.push(format!("old:{}", kind(event)));
            Propagation::Forward
        }) as Box<dyn WindowHandler<Desk>>);
        chain.push(Box::new(move |desk: &mut Desk, window: WindowId, event: &WindowEvent| {
            desk.log.push(format!("top:{}", kind(event)));
            if kind(event) == "map" {
                assert!(desk.chains.get_mut(&window).is_some_and(|c| c.remove(old)));
                if let Some(chain) = desk.chains.remove(&window) {
                    retire(desk, window, chain);
                }
            }
            Propagation::Stop
        }) as Box<dyn WindowHandler<Desk>>);
        desk.chains.insert(window, chain);

        deliver(&mut desk, window, map_event());
        assert_eq!(desk.log, ["top:map", "top:destroying"]);
        assert!(desk.orphans.is_empty());
    }

    #[test]
    fn test_handler_added_mid_dispatch_sees_teardown_once() {
        let window = WindowId::from_xid(0x40);
        let mut desk = Desk::default();
        let mut chain = HandlerChain::new();
        chain.push(Box::new(|desk: &mut Desk, window: WindowId, event: &WindowEvent| {
            desk.log.push(format!("first:{}", kind(event)));
            if kind(event) == "map" {
                if let Some(chain) = desk.chains.get_mut(&window) {
                    chain.push(Box::new(|desk: &mut Desk, _: WindowId, event: &WindowEvent| {
                        desk.log.push(format!("late:{}", kind(event)));
                        Propagation::Forward
                    }));
                }
                if let Some(chain) = desk.chains.remove(&window) {
                    retire(desk, window, chain);
                }
            }
            Propagation::Stop
        }) as Box<dyn WindowHandler<Desk>>);
        desk.chains.insert(window, chain);

        deliver(&mut desk, window, map_event());
        assert_eq!(desk.log, ["first:map", "late:destroying", "first:destroying"]);
    }

    #[test]
    fn test_handler_ids_are_unique() {
        let mut a: HandlerChain<Log> = HandlerChain::new();
        let mut b: HandlerChain<Log> = HandlerChain::new();
        let x = a.push(named("x", Propagation::Stop));
        let y = b.push(named("y", Propagation::Stop));
        assert_ne!(x, y);
    }
}
