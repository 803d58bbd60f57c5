//! Error type shared by every toolkit operation

use std::io;

use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

/// Errors reported by the toolkit
///
/// Protocol failures are wrapped as-is; everything else names the toolkit
/// rule that was broken.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to the X server: {0}")]
    Connect(#[from] ConnectError),

    #[error("X connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("X request failed: {0}")]
    Reply(#[from] ReplyError),

    #[error("X request failed: {0}")]
    ReplyOrId(#[from] ReplyOrIdError),

    #[error("display name contains a NUL byte")]
    InvalidDisplayName,

    #[error("GL setup failed: {0}")]
    Gl(String),

    #[error("GL rendering was not requested when connecting")]
    GlUnavailable,

    #[error("window {0:#x} has no GL context")]
    NotGlWindow(u32),

    #[error("screen {0} does not exist")]
    NoSuchScreen(usize),

    #[error("window {0:#x} is not managed by this connection")]
    UnknownWindow(u32),

    #[error("GL windows must have a non-root parent")]
    RootParent,

    #[error("window {0:#x} was destroyed before it got mapped")]
    DestroyedBeforeMap(u32),

    #[error("common atoms were not interned on connect")]
    AtomsUnavailable,

    #[error("timer table is full ({0} timers)")]
    TooManyTimers(usize),

    #[error("at most {0} extra descriptors can be watched")]
    TooManyWatches(usize),

    #[error("embedding adapter failed: {0}")]
    Embed(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),
}

/// Toolkit result alias
pub type Result<T> = std::result::Result<T, Error>;
