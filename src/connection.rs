//! The toolkit connection
//!
//! One [`Connection`] per display session. It owns every window created on
//! it, the timer table, the extra descriptor watches, the cached atoms and
//! the optional embedding adapter. Dropping it tears all of that down.

use std::collections::HashMap;
use std::ffi::{CString, c_void};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, info, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{Atom, ConnectionExt as _, Screen};
use x11rb::xcb_ffi::XCBConnection;

use crate::atoms::{Atoms, CommonAtom};
use crate::config::Config;
use crate::embed::EmbedSlot;
use crate::error::{Error, Result};
use crate::gl_context::GlDisplay;
use crate::handler::{HandlerChain, WindowEvent};
use crate::timer::TimerTable;
use crate::watch::WatchList;
use crate::window::{WindowId, WindowState};

bitflags::bitflags! {
    /// Options for [`Connection::connect`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectFlags: u32 {
        /// Open through Xlib so GL windows can be created
        const USE_GL = 1;
        /// Intern the common atoms up front
        const INIT_ATOMS = 1 << 1;
    }
}

/// Default upper bound on one blocking wait of [`Connection::event_loop`]
pub const DEFAULT_IDLE_WAKEUP: Duration = Duration::from_millis(100);

/// A connection to the X server plus everything created on it
///
/// Not `Send`: all calls happen on the thread that created it.
pub struct Connection {
    // field order is drop order: adapter and windows go before the
    // XCB connection, which goes before the Xlib display owning it
    pub(crate) embed: EmbedSlot,
    pub(crate) windows: HashMap<WindowId, WindowState>,
    // chains of windows torn down while their dispatch was running
    pub(crate) orphaned: HashMap<WindowId, HandlerChain<Connection>>,
    pub(crate) timers: TimerTable<Connection>,
    pub(crate) watches: WatchList<Connection>,
    atoms: Option<Atoms>,
    default_screen: usize,
    pub(crate) idle_wakeup: Duration,
    pub(crate) conn: XCBConnection,
    pub(crate) gl: Option<GlDisplay>,
}

impl Connection {
    /// Connect to `display` (`$DISPLAY` when `None`)
    pub fn connect(flags: ConnectFlags, display: Option<&str>) -> Result<Self> {
        let (conn, gl, default_screen) = if flags.contains(ConnectFlags::USE_GL) {
            let gl = GlDisplay::open(display)?;
            // The XCB side stays owned by Xlib; XCloseDisplay frees it
            let conn = unsafe { XCBConnection::from_raw_xcb_connection(gl.xcb_connection(), false)? };
            let screen = gl.default_screen();
            (conn, Some(gl), screen)
        } else {
            let name = display
                .map(CString::new)
                .transpose()
                .map_err(|_| Error::InvalidDisplayName)?;
            let (conn, screen) = XCBConnection::connect(name.as_deref())?;
            (conn, None, screen)
        };

        let atoms = if flags.contains(ConnectFlags::INIT_ATOMS) {
            Some(Atoms::intern(&conn)?)
        } else {
            None
        };

        let setup = conn.setup();
        info!(
            "Connected to X server (vendor {}, {} screen(s), default {}, GL: {})",
            String::from_utf8_lossy(&setup.vendor),
            setup.roots.len(),
            default_screen,
            gl.is_some()
        );

        Ok(Self {
            embed: EmbedSlot::default(),
            windows: HashMap::new(),
            orphaned: HashMap::new(),
            timers: TimerTable::new(),
            watches: WatchList::new(),
            atoms,
            default_screen,
            idle_wakeup: DEFAULT_IDLE_WAKEUP,
            conn,
            gl,
        })
    }

    /// Connect with the options of a loaded [`Config`]
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut connection =
            Self::connect(config.connection.flags(), config.connection.display.as_deref())?;
        connection.set_idle_wakeup(Duration::from_millis(config.event_loop.idle_wakeup_ms));
        Ok(connection)
    }

    /// Tear down every window and close the connection
    ///
    /// Same as dropping, except that a failing final flush is reported.
    pub fn disconnect(mut self) -> Result<()> {
        self.shutdown();
        self.conn.flush()?;
        Ok(())
    }

    /// Round trip to the server; every request sent before has been handled
    pub fn sync(&self) -> Result<()> {
        self.conn.get_input_focus()?.reply()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    pub fn default_screen(&self) -> usize {
        self.default_screen
    }

    pub fn screen_count(&self) -> usize {
        self.conn.setup().roots.len()
    }

    /// Screen description, `None` for an out of range index
    pub fn screen_info(&self, screen: usize) -> Option<&Screen> {
        self.conn.setup().roots.get(screen)
    }

    /// Cached atom, `None` when atoms were not interned on connect
    pub fn atom(&self, atom: CommonAtom) -> Option<Atom> {
        self.atoms.map(|atoms| atoms.get(atom))
    }

    /// True for a `WM_DELETE_WINDOW` request from the window manager
    pub fn is_close_request(&self, event: &WindowEvent) -> bool {
        let (Some(protocols), Some(delete)) =
            (self.atom(CommonAtom::WmProtocols), self.atom(CommonAtom::WmDeleteWindow))
        else {
            return false;
        };
        match event {
            WindowEvent::Protocol(x11rb::protocol::Event::ClientMessage(msg)) => {
                msg.type_ == protocols && msg.format == 32 && msg.data.as_data32()[0] == delete
            }
            _ => false,
        }
    }

    /// Underlying Xlib `Display*` of a GL connection
    pub fn xlib_display(&self) -> Option<*mut c_void> {
        self.gl.as_ref().map(|gl| gl.raw() as *mut c_void)
    }

    /// The XCB connection, for requests the toolkit does not wrap
    pub fn xcb(&self) -> &XCBConnection {
        &self.conn
    }

    /// Descriptor of the X connection
    pub fn fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }

    /// Address of a GL entry point; `None` without GL or for unknown names
    pub fn gl_proc_address(&self, name: &str) -> Option<*const c_void> {
        let ptr = self.gl.as_ref()?.proc_address(name);
        (!ptr.is_null()).then_some(ptr)
    }

    /// Longest single wait of the blocking loop while an exit flag is set
    pub fn set_idle_wakeup(&mut self, wakeup: Duration) {
        self.idle_wakeup = wakeup.max(Duration::from_millis(1));
    }

    fn shutdown(&mut self) {
        self.embed.clear();
        let cancelled = self.timers.clear();
        if cancelled > 0 {
            debug!("Dropped {} pending timer(s)", cancelled);
        }

        // Children of tracked windows vanish with their parent on the server
        let ids: Vec<WindowId> = self.windows.keys().copied().collect();
        let (children, tops): (Vec<WindowId>, Vec<WindowId>) = ids.into_iter().partition(|id| {
            self.windows
                .get(id)
                .is_some_and(|w| self.windows.contains_key(&WindowId::from_xid(w.parent)))
        });
        for id in children {
            if let Err(err) = self.teardown(id, false) {
                warn!("Failed to tear down window {}: {}", id, err);
            }
        }
        for id in tops {
            if let Err(err) = self.teardown(id, true) {
                warn!("Failed to destroy window {}: {}", id, err);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
        if let Err(err) = self.conn.flush() {
            warn!("Final flush failed: {}", err);
        }
        info!("Disconnected from X server");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_flags_compose() {
        let flags = ConnectFlags::USE_GL | ConnectFlags::INIT_ATOMS;
        assert!(flags.contains(ConnectFlags::USE_GL));
        assert_eq!(flags.bits(), 3);
        assert!(!ConnectFlags::empty().contains(ConnectFlags::INIT_ATOMS));
    }

    #[test]
    fn test_nul_in_display_name_is_rejected() {
        let err = Connection::connect(ConnectFlags::empty(), Some(":0\0junk")).err();
        assert!(matches!(err, Some(Error::InvalidDisplayName)));
    }
}
