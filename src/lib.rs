//! xcbkit
//!
//! A small XCB windowing toolkit: a connection, top-level windows and GL
//! child windows (also inside foreign parents, for plugin style embedding),
//! per-window handler chains, one-shot timers and an event processor that
//! can run its own loop or be driven by a host main loop.
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use xcbkit::{ConnectFlags, Connection, Propagation, Rect, WindowEvent, WindowId};
//!
//! # fn main() -> xcbkit::Result<()> {
//! let mut conn = Connection::connect(ConnectFlags::INIT_ATOMS, None)?;
//! let screen = conn.default_screen();
//! let window = conn.create_top_window(screen, Some("hello"), Rect::sized(320, 240))?;
//! conn.push_handler(window, |conn: &mut Connection, _: WindowId, event: &WindowEvent| {
//!     if conn.is_close_request(event) {
//!         // flip an exit flag here
//!     }
//!     Propagation::Stop
//! })?;
//! conn.map_window(window)?;
//!
//! let exit = AtomicBool::new(false);
//! conn.event_loop(Some(&exit))?;
//! # Ok(())
//! # }
//! ```

mod atoms;
pub mod config;
mod connection;
mod draw;
pub mod embed;
mod error;
mod event_loop;
mod geometry;
mod gl_context;
mod handler;
mod timer;
mod watch;
mod window;

pub use atoms::CommonAtom;
pub use config::{Config, ConfigError};
pub use connection::{ConnectFlags, Connection, DEFAULT_IDLE_WAKEUP};
pub use embed::{Embed, MioEmbed, MioEmbedHandle, TokioEmbed, TokioEmbedHandle};
pub use error::{Error, Result};
pub use geometry::Rect;
pub use handler::{HandlerId, Propagation, WindowEvent, WindowHandler};
pub use timer::{MAX_TIMERS, TimerId};
pub use watch::MAX_EXTRA_WATCHES;
pub use window::{GlRequest, WindowId};

/// Protocol types handlers commonly match on
pub use x11rb::protocol::Event;
pub use x11rb::protocol::xproto;
