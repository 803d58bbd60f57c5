//! Window creation, teardown, mapping and per-window state
//!
//! Windows are owned by their [`Connection`] and addressed by [`WindowId`].
//! Queries on an unknown id return neutral values; commands return
//! [`Error::UnknownWindow`] without touching the server.

use std::ffi::c_void;
use std::fmt;

use tracing::{debug, info, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ColormapAlloc, ConnectionExt as _, CreateGCAux,
    CreateWindowAux, EventMask, Gcontext, MapState, PropMode, Window, WindowClass,
};
use x11rb::wrapper::ConnectionExt as _;
use x11rb::COPY_DEPTH_FROM_PARENT;

use crate::atoms::CommonAtom;
use crate::connection::Connection;
use crate::draw::{DrawSession, Transition};
use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::gl_context::GlContext;
use crate::handler::{self, ChainStore, HandlerChain, HandlerId, WindowHandler};

/// Toolkit handle of a window: its XID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(Window);

impl WindowId {
    pub const fn from_xid(xid: Window) -> Self {
        Self(xid)
    }

    pub const fn xid(self) -> Window {
        self.0
    }
}

impl fmt::Debug for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WindowId({:#x})", self.0)
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// GL version and flags for a GL window's context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlRequest {
    pub major: u8,
    pub minor: u8,
    pub debug: bool,
}

impl Default for GlRequest {
    fn default() -> Self {
        Self {
            major: 3,
            minor: 0,
            debug: false,
        }
    }
}

/// Events every toolkit window listens to
pub(crate) fn window_event_mask() -> EventMask {
    EventMask::EXPOSURE
        | EventMask::STRUCTURE_NOTIFY
        | EventMask::KEY_PRESS
        | EventMask::KEY_RELEASE
        | EventMask::BUTTON_PRESS
        | EventMask::BUTTON_RELEASE
        | EventMask::POINTER_MOTION
        | EventMask::ENTER_WINDOW
        | EventMask::LEAVE_WINDOW
        | EventMask::FOCUS_CHANGE
        | EventMask::PROPERTY_CHANGE
}

pub(crate) struct GlSurface {
    pub context: GlContext,
    pub colormap: u32,
    pub session: DrawSession,
}

/// What the connection knows about one window
pub(crate) struct WindowState {
    pub parent: Window,
    pub screen: usize,
    pub rect: Rect,
    pub mapped: bool,
    /// False once the server reported the window destroyed
    pub alive: bool,
    pub handlers: HandlerChain<Connection>,
    pub gl: Option<GlSurface>,
}

impl WindowState {
    pub fn new(parent: Window, screen: usize, rect: Rect) -> Self {
        Self {
            parent,
            screen,
            rect,
            mapped: false,
            alive: true,
            handlers: HandlerChain::new(),
            gl: None,
        }
    }

    /// Fold a structure event into the cached state
    pub fn track(&mut self, id: WindowId, event: &Event) {
        match event {
            Event::ConfigureNotify(e) if e.window == id.xid() => {
                self.rect = Rect::new(e.x, e.y, e.width, e.height);
            }
            Event::MapNotify(e) if e.window == id.xid() => self.mapped = true,
            Event::UnmapNotify(e) if e.window == id.xid() => self.mapped = false,
            Event::ReparentNotify(e) if e.window == id.xid() => {
                self.parent = e.parent;
                self.rect.x = e.x;
                self.rect.y = e.y;
            }
            Event::DestroyNotify(e) if e.window == id.xid() => {
                self.alive = false;
                self.mapped = false;
            }
            _ => {}
        }
    }
}

/// Window an event should be routed to
pub(crate) fn event_window(event: &Event) -> Option<Window> {
    let window = match event {
        Event::Expose(e) => e.window,
        Event::ConfigureNotify(e) => e.window,
        Event::MapNotify(e) => e.window,
        Event::UnmapNotify(e) => e.window,
        Event::ReparentNotify(e) => e.window,
        Event::DestroyNotify(e) => e.window,
        Event::VisibilityNotify(e) => e.window,
        Event::GravityNotify(e) => e.window,
        Event::CirculateNotify(e) => e.window,
        Event::ClientMessage(e) => e.window,
        Event::PropertyNotify(e) => e.window,
        Event::KeyPress(e) => e.event,
        Event::KeyRelease(e) => e.event,
        Event::ButtonPress(e) => e.event,
        Event::ButtonRelease(e) => e.event,
        Event::MotionNotify(e) => e.event,
        Event::EnterNotify(e) => e.event,
        Event::LeaveNotify(e) => e.event,
        Event::FocusIn(e) => e.event,
        Event::FocusOut(e) => e.event,
        Event::SelectionNotify(e) => e.requestor,
        Event::SelectionRequest(e) => e.owner,
        Event::SelectionClear(e) => e.owner,
        _ => return None,
    };
    Some(window)
}

impl Connection {
    /// Create a top-level window on `screen`
    ///
    /// `title` is set as ASCII `WM_NAME`. When the common atoms were
    /// interned the window takes part in the `WM_DELETE_WINDOW` protocol.
    pub fn create_top_window(&mut self, screen: usize, title: Option<&str>, rect: Rect) -> Result<WindowId> {
        let root = self
            .screen_info(screen)
            .ok_or(Error::NoSuchScreen(screen))?
            .root;
        let xid = self.xcb().generate_id()?;
        let r = rect.creatable();

        self.xcb().create_window(
            COPY_DEPTH_FROM_PARENT,
            xid,
            root,
            r.x,
            r.y,
            r.width,
            r.height,
            0,
            WindowClass::INPUT_OUTPUT,
            0, // CopyFromParent visual
            &CreateWindowAux::new().event_mask(window_event_mask()),
        )?;

        if let Some(title) = title {
            self.xcb().change_property8(
                PropMode::REPLACE,
                xid,
                AtomEnum::WM_NAME,
                AtomEnum::STRING,
                title.as_bytes(),
            )?;
        }
        if let (Some(protocols), Some(delete)) =
            (self.atom(CommonAtom::WmProtocols), self.atom(CommonAtom::WmDeleteWindow))
        {
            self.xcb()
                .change_property32(PropMode::REPLACE, xid, protocols, AtomEnum::ATOM, &[delete])?;
        }

        let id = WindowId(xid);
        self.windows.insert(id, WindowState::new(root, screen, r));
        info!("Created top-level window {} on screen {} ({}x{})", id, screen, r.width, r.height);
        Ok(id)
    }

    /// Create a GL child window inside `parent`
    ///
    /// `parent` may be a foreign window (an embedding host) but not a root.
    pub fn create_gl_window(&mut self, parent: Window, rect: Rect, request: GlRequest) -> Result<WindowId> {
        if self.gl.is_none() {
            return Err(Error::GlUnavailable);
        }
        if parent == x11rb::NONE || self.xcb().setup().roots.iter().any(|s| s.root == parent) {
            return Err(Error::RootParent);
        }

        let parent_root = self.xcb().query_tree(parent)?.reply()?.root;
        let screen = self
            .xcb()
            .setup()
            .roots
            .iter()
            .position(|s| s.root == parent_root)
            .unwrap_or(self.default_screen());

        let gl = self.gl.as_ref().ok_or(Error::GlUnavailable)?;
        let config = gl.choose_config(screen)?;
        let conn = &self.conn;

        let colormap = conn.generate_id()?;
        conn.create_colormap(ColormapAlloc::NONE, colormap, parent_root, config.visual_id)?;

        let xid = conn.generate_id()?;
        let r = rect.creatable();
        let aux = CreateWindowAux::new()
            .event_mask(window_event_mask())
            .colormap(colormap)
            .border_pixel(0)
            .background_pixmap(x11rb::NONE);
        let created = conn.create_window(
            config.depth,
            xid,
            parent,
            r.x,
            r.y,
            r.width,
            r.height,
            0,
            WindowClass::INPUT_OUTPUT,
            config.visual_id,
            &aux,
        );
        if let Err(err) = created {
            let _ = conn.free_colormap(colormap);
            return Err(err.into());
        }
        // GLX talks to the server through Xlib; the window must exist there first
        conn.flush()?;

        let context = match gl.create_context(&config, request) {
            Ok(context) => context,
            Err(err) => {
                let _ = conn.destroy_window(xid);
                let _ = conn.free_colormap(colormap);
                return Err(err);
            }
        };

        let id = WindowId(xid);
        let mut state = WindowState::new(parent, screen, r);
        state.gl = Some(GlSurface {
            context,
            colormap,
            session: DrawSession::default(),
        });
        self.windows.insert(id, state);
        info!(
            "Created GL window {} in {:#x} ({}x{}, GL {}.{})",
            id, parent, r.width, r.height, request.major, request.minor
        );
        Ok(id)
    }

    /// Destroy the window on the server and forget it
    ///
    /// Handlers receive [`WindowEvent::Destroying`](crate::WindowEvent::Destroying) after the destroy request
    /// was sent. Children created on this connection are destroyed by the
    /// server asynchronously; call [`Connection::parent_destroyed`] for them
    /// and never use their XIDs again.
    pub fn destroy_window(&mut self, id: WindowId) -> Result<()> {
        self.teardown(id, true)
    }

    /// Forget a window whose ancestor was destroyed
    ///
    /// The server already destroys descendants on its own, so no request is
    /// sent. There is no synchronous signal marking the moment the XID goes
    /// stale; it must not be used after the ancestor's destruction.
    pub fn parent_destroyed(&mut self, id: WindowId) -> Result<()> {
        self.teardown(id, false)
    }

    pub(crate) fn teardown(&mut self, id: WindowId, send_destroy: bool) -> Result<()> {
        let mut state = self.windows.remove(&id).ok_or(Error::UnknownWindow(id.xid()))?;
        let mut result = Ok(());

        if let Some(surface) = state.gl.take() {
            if let Some(gl) = self.gl.as_ref() {
                gl.destroy_context(surface.context);
            }
            if let Err(err) = self.conn.free_colormap(surface.colormap) {
                result = Err(err.into());
            }
        }
        if send_destroy && state.alive {
            if let Err(err) = self.conn.destroy_window(id.xid()) {
                result = Err(err.into());
            }
        }

        let children = self.windows.values().filter(|w| w.parent == id.xid()).count();
        if children > 0 {
            debug!("Window {} torn down with {} tracked children still alive", id, children);
        }

        handler::retire(self, id, state.handlers);
        debug!("Window {} torn down (destroy request: {})", id, send_destroy && state.alive);
        result
    }

    pub fn map_window(&mut self, id: WindowId) -> Result<()> {
        self.known(id)?;
        self.conn.map_window(id.xid())?;
        self.state_mut(id)?.mapped = true;
        Ok(())
    }

    pub fn unmap_window(&mut self, id: WindowId) -> Result<()> {
        self.known(id)?;
        self.conn.unmap_window(id.xid())?;
        self.state_mut(id)?.mapped = false;
        Ok(())
    }

    /// Block until the server confirms the window is mapped
    ///
    /// Meant for embedded windows right after mapping, before their XID is
    /// reported to the embedder. Other events read meanwhile are dispatched
    /// as usual.
    pub fn wait_mapped(&mut self, id: WindowId) -> Result<()> {
        self.known(id)?;
        self.conn.flush()?;
        let attrs = self.conn.get_window_attributes(id.xid())?.reply()?;
        if attrs.map_state != MapState::UNMAPPED {
            self.state_mut(id)?.mapped = true;
            return Ok(());
        }

        debug!("Waiting for window {} to be mapped", id);
        loop {
            let event = self.conn.wait_for_event()?;
            let mapped = matches!(&event, Event::MapNotify(e) if e.window == id.xid());
            let destroyed = matches!(&event, Event::DestroyNotify(e) if e.window == id.xid());
            self.dispatch_event(event);
            if mapped {
                trace!("Window {} mapped", id);
                return Ok(());
            }
            if destroyed || !self.windows.contains_key(&id) {
                return Err(Error::DestroyedBeforeMap(id.xid()));
            }
        }
    }

    /// Current client area from the server, origin fixed at zero
    pub fn client_size(&mut self, id: WindowId) -> Result<Rect> {
        self.known(id)?;
        let geometry = self.conn.get_geometry(id.xid())?.reply()?;
        let state = self.state_mut(id)?;
        state.rect.width = geometry.width;
        state.rect.height = geometry.height;
        Ok(Rect::sized(geometry.width, geometry.height))
    }

    /// Last known position and size
    pub fn window_rect(&self, id: WindowId) -> Option<Rect> {
        self.windows.get(&id).map(|w| w.rect)
    }

    pub fn window_parent(&self, id: WindowId) -> Option<Window> {
        self.windows.get(&id).map(|w| w.parent)
    }

    pub fn window_screen(&self, id: WindowId) -> Option<usize> {
        self.windows.get(&id).map(|w| w.screen)
    }

    pub fn is_mapped(&self, id: WindowId) -> bool {
        self.windows.get(&id).is_some_and(|w| w.mapped)
    }

    /// True between an outermost `draw_begin` and its end or stop
    pub fn is_drawing(&self, id: WindowId) -> bool {
        self.windows
            .get(&id)
            .and_then(|w| w.gl.as_ref())
            .is_some_and(|gl| gl.session.is_drawing())
    }

    pub fn is_gl_window(&self, id: WindowId) -> bool {
        self.windows.get(&id).is_some_and(|w| w.gl.is_some())
    }

    pub fn windows(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.windows.keys().copied()
    }

    /// Publish `_XEMBED_INFO` (version 0) with the known mapped state
    pub fn set_xembed_info(&mut self, id: WindowId) -> Result<()> {
        let mapped = self.known(id)?.mapped;
        let atom = self.atom(CommonAtom::XembedInfo).ok_or(Error::AtomsUnavailable)?;
        self.conn
            .change_property32(PropMode::REPLACE, id.xid(), atom, atom, &[0, u32::from(mapped)])?;
        Ok(())
    }

    /// Pass-through for `ChangeWindowAttributes`
    pub fn change_attributes(&mut self, id: WindowId, aux: &ChangeWindowAttributesAux) -> Result<()> {
        self.known(id)?;
        self.conn.change_window_attributes(id.xid(), aux)?;
        Ok(())
    }

    /// New graphics context for the window
    pub fn create_gc(&mut self, id: WindowId, aux: &CreateGCAux) -> Result<Gcontext> {
        self.known(id)?;
        let gc = self.conn.generate_id()?;
        self.conn.create_gc(gc, id.xid(), aux)?;
        Ok(gc)
    }

    /// Install a handler on top of the window's chain
    ///
    /// It sees events first; returning `Propagation::Forward` hands them to
    /// the handler installed before it.
    pub fn push_handler<H>(&mut self, id: WindowId, handler: H) -> Result<HandlerId>
    where
        H: WindowHandler<Connection> + 'static,
    {
        let state = self.state_mut(id)?;
        Ok(state.handlers.push(Box::new(handler)))
    }

    /// Remove a handler, making the previous one the top of the chain
    pub fn remove_handler(&mut self, id: WindowId, handler: HandlerId) -> bool {
        self.windows
            .get_mut(&id)
            .is_some_and(|w| w.handlers.remove(handler))
    }

    pub fn handler_count(&self, id: WindowId) -> usize {
        self.windows.get(&id).map_or(0, |w| w.handlers.len())
    }

    /// Make the window's GL context current
    ///
    /// Nested begins (painting inside painting) only count depth. Returns
    /// the raw `GLXContext`.
    pub fn draw_begin(&mut self, id: WindowId) -> Result<*mut c_void> {
        let gl = self.gl.as_ref().ok_or(Error::GlUnavailable)?;
        let state = self.windows.get_mut(&id).ok_or(Error::UnknownWindow(id.xid()))?;
        let surface = state.gl.as_mut().ok_or(Error::NotGlWindow(id.xid()))?;

        if surface.session.begin() == Transition::Activate
            && !gl.make_current(id.xid(), &surface.context)
        {
            surface.session.abort();
            return Err(Error::Gl(format!("glXMakeCurrent failed for window {id}")));
        }
        Ok(surface.context.as_ptr())
    }

    /// Finish drawing and present; true only when the outermost session ended
    pub fn draw_end(&mut self, id: WindowId) -> Result<bool> {
        self.draw_finish(id, true)
    }

    /// Finish drawing and discard; true only when the outermost session ended
    pub fn draw_stop(&mut self, id: WindowId) -> Result<bool> {
        self.draw_finish(id, false)
    }

    fn draw_finish(&mut self, id: WindowId, present: bool) -> Result<bool> {
        let gl = self.gl.as_ref().ok_or(Error::GlUnavailable)?;
        let state = self.windows.get_mut(&id).ok_or(Error::UnknownWindow(id.xid()))?;
        let surface = state.gl.as_mut().ok_or(Error::NotGlWindow(id.xid()))?;

        let transition = if present {
            surface.session.end()
        } else {
            surface.session.stop()
        };
        match transition {
            Transition::Present => {
                gl.swap_buffers(id.xid());
                gl.release_current();
                Ok(true)
            }
            Transition::Discard => {
                gl.release_current();
                Ok(true)
            }
            Transition::Activate | Transition::None => Ok(false),
        }
    }

    fn known(&self, id: WindowId) -> Result<&WindowState> {
        let state = self.windows.get(&id).ok_or(Error::UnknownWindow(id.xid()))?;
        if !state.alive {
            warn!("Window {} was destroyed by the server, request will fail", id);
        }
        Ok(state)
    }

    fn state_mut(&mut self, id: WindowId) -> Result<&mut WindowState> {
        self.windows.get_mut(&id).ok_or(Error::UnknownWindow(id.xid()))
    }
}

impl ChainStore for Connection {
    fn chain_mut(&mut self, window: WindowId) -> Option<&mut HandlerChain<Self>> {
        self.windows.get_mut(&window).map(|w| &mut w.handlers)
    }

    fn store_orphan(&mut self, window: WindowId, chain: HandlerChain<Self>) {
        self.orphaned.insert(window, chain);
    }

    fn take_orphan(&mut self, window: WindowId) -> Option<HandlerChain<Self>> {
        self.orphaned.remove(&window)
    }
}
