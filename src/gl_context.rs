//! GLX plumbing for GL capable windows
//!
//! GL needs an Xlib `Display`, so GL connections are opened through Xlib and
//! the toolkit talks XCB over the connection Xlib created. Everything here is
//! loaded at runtime with x11-dl.

use std::ffi::{CStr, CString, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::{debug, info, warn};
use x11_dl::glx::{self, Glx};
use x11_dl::xlib::{self, Xlib};
use x11_dl::xlib_xcb::{XEventQueueOwner, Xlib_xcb};

use crate::error::{Error, Result};
use crate::window::GlRequest;

const GLX_CONTEXT_MAJOR_VERSION_ARB: c_int = 0x2091;
const GLX_CONTEXT_MINOR_VERSION_ARB: c_int = 0x2092;
const GLX_CONTEXT_FLAGS_ARB: c_int = 0x2094;
const GLX_CONTEXT_DEBUG_BIT_ARB: c_int = 0x0001;

type GlXCreateContextAttribsArb = unsafe extern "C" fn(
    *mut xlib::Display,
    glx::GLXFBConfig,
    glx::GLXContext,
    xlib::Bool,
    *const c_int,
) -> glx::GLXContext;

static X_ERROR_OCCURRED: AtomicBool = AtomicBool::new(false);
static X_ERROR_CODE: AtomicI32 = AtomicI32::new(0);

// Xlib's default handler exits the process; record and log instead
unsafe extern "C" fn x_error_handler(
    _display: *mut xlib::Display,
    event: *mut xlib::XErrorEvent,
) -> c_int {
    if !event.is_null() {
        let (error_code, request_code, minor_code) =
            unsafe { ((*event).error_code, (*event).request_code, (*event).minor_code) };
        if !X_ERROR_OCCURRED.swap(true, Ordering::Relaxed) {
            X_ERROR_CODE.store(i32::from(error_code), Ordering::Relaxed);
        }
        warn!(
            "X error (Xlib side): code={}, request={}, minor={}",
            error_code, request_code, minor_code
        );
    }
    0
}

type ErrorHandler = Option<unsafe extern "C" fn(*mut xlib::Display, *mut xlib::XErrorEvent) -> c_int>;
type SetErrorHandler = unsafe extern "C" fn(ErrorHandler) -> ErrorHandler;

/// Routes Xlib errors to [`x_error_handler`] until dropped
///
/// The error handler is process global; whatever the host installed is put
/// back on drop.
struct ErrorTrap {
    set: SetErrorHandler,
    previous: ErrorHandler,
}

impl ErrorTrap {
    fn install(set: SetErrorHandler) -> Self {
        X_ERROR_OCCURRED.store(false, Ordering::Relaxed);
        X_ERROR_CODE.store(0, Ordering::Relaxed);
        let previous = unsafe { set(Some(x_error_handler)) };
        Self { set, previous }
    }

    /// Code of the first error seen since install
    fn error_code(&self) -> Option<i32> {
        X_ERROR_OCCURRED
            .load(Ordering::Relaxed)
            .then(|| X_ERROR_CODE.load(Ordering::Relaxed))
    }
}

impl Drop for ErrorTrap {
    fn drop(&mut self) {
        unsafe { (self.set)(self.previous) };
    }
}

/// Framebuffer configuration picked for a screen
#[derive(Debug, Clone, Copy)]
pub(crate) struct FbConfig {
    raw: glx::GLXFBConfig,
    pub visual_id: u32,
    pub depth: u8,
}

/// A GLX rendering context
#[derive(Debug)]
pub(crate) struct GlContext {
    raw: glx::GLXContext,
}

impl GlContext {
    pub fn as_ptr(&self) -> *mut c_void {
        self.raw as *mut c_void
    }
}

/// Xlib display plus the GLX entry points
pub(crate) struct GlDisplay {
    xlib: Xlib,
    glx: Glx,
    display: *mut xlib::Display,
    xcb: *mut c_void,
    create_context_attribs: Option<GlXCreateContextAttribsArb>,
}

impl GlDisplay {
    /// Open the display through Xlib and locate its XCB connection
    pub fn open(display_name: Option<&str>) -> Result<Self> {
        let xlib = Xlib::open().map_err(|e| Error::Gl(format!("failed to load libX11: {e}")))?;
        let xlib_xcb =
            Xlib_xcb::open().map_err(|e| Error::Gl(format!("failed to load libX11-xcb: {e}")))?;
        let glx = Glx::open().map_err(|e| Error::Gl(format!("failed to load libGLX: {e}")))?;

        let name = display_name
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::InvalidDisplayName)?;
        let display = unsafe {
            (xlib.XOpenDisplay)(name.as_ref().map_or(ptr::null(), |n| n.as_ptr()))
        };
        if display.is_null() {
            return Err(Error::Gl(format!(
                "XOpenDisplay({}) failed",
                display_name.unwrap_or("$DISPLAY")
            )));
        }

        let xcb = unsafe { (xlib_xcb.XGetXCBConnection)(display) } as *mut c_void;
        if xcb.is_null() {
            unsafe { (xlib.XCloseDisplay)(display) };
            return Err(Error::Gl("display has no XCB connection".into()));
        }
        // events are read through XCB only; Xlib must not queue them
        unsafe { (xlib_xcb.XSetEventQueueOwner)(display, XEventQueueOwner::XCBOwnsEventQueue) };

        let mut major = 0;
        let mut minor = 0;
        let have_glx = unsafe { (glx.glXQueryVersion)(display, &mut major, &mut minor) } != 0;
        if !have_glx {
            unsafe { (xlib.XCloseDisplay)(display) };
            return Err(Error::Gl("GLX extension not available".into()));
        }
        info!("GLX version {}.{}", major, minor);

        let create_context_attribs = unsafe {
            (glx.glXGetProcAddress)(c"glXCreateContextAttribsARB".as_ptr() as *const _)
                .map(|f| std::mem::transmute::<unsafe extern "C" fn(), GlXCreateContextAttribsArb>(f))
        };
        if create_context_attribs.is_none() {
            warn!("glXCreateContextAttribsARB missing, GL version requests are ignored");
        }

        Ok(Self {
            xlib,
            glx,
            display,
            xcb,
            create_context_attribs,
        })
    }

    pub fn raw(&self) -> *mut xlib::Display {
        self.display
    }

    /// The `xcb_connection_t*` owned by the display
    pub fn xcb_connection(&self) -> *mut c_void {
        self.xcb
    }

    pub fn default_screen(&self) -> usize {
        let screen = unsafe { (self.xlib.XDefaultScreen)(self.display) };
        usize::try_from(screen).unwrap_or(0)
    }

    /// Double buffered RGBA8 window config with depth and stencil
    pub fn choose_config(&self, screen: usize) -> Result<FbConfig> {
        let attribs = [
            glx::GLX_X_RENDERABLE as c_int, 1,
            glx::GLX_DRAWABLE_TYPE as c_int, glx::GLX_WINDOW_BIT as c_int,
            glx::GLX_RENDER_TYPE as c_int, glx::GLX_RGBA_BIT as c_int,
            glx::GLX_X_VISUAL_TYPE as c_int, glx::GLX_TRUE_COLOR as c_int,
            glx::GLX_RED_SIZE as c_int, 8,
            glx::GLX_GREEN_SIZE as c_int, 8,
            glx::GLX_BLUE_SIZE as c_int, 8,
            glx::GLX_ALPHA_SIZE as c_int, 8,
            glx::GLX_DEPTH_SIZE as c_int, 24,
            glx::GLX_STENCIL_SIZE as c_int, 8,
            glx::GLX_DOUBLEBUFFER as c_int, 1,
            0,
        ];

        let mut count = 0;
        let configs = unsafe {
            (self.glx.glXChooseFBConfig)(self.display, screen as c_int, attribs.as_ptr(), &mut count)
        };
        if configs.is_null() || count == 0 {
            return Err(Error::Gl(format!("no suitable GLX FBConfig on screen {screen}")));
        }
        let raw = unsafe { *configs };
        unsafe { (self.xlib.XFree)(configs as *mut _) };

        let vinfo = unsafe { (self.glx.glXGetVisualFromFBConfig)(self.display, raw) };
        if vinfo.is_null() {
            return Err(Error::Gl("FBConfig has no X visual".into()));
        }
        let (visual_id, depth) = unsafe { ((*vinfo).visualid as u32, (*vinfo).depth as u8) };
        unsafe { (self.xlib.XFree)(vinfo as *mut _) };

        debug!("Selected FBConfig: visual=0x{:x}, depth={}", visual_id, depth);
        Ok(FbConfig { raw, visual_id, depth })
    }

    /// Create a context for `config`, honoring the requested version when
    /// the ARB entry point exists
    pub fn create_context(&self, config: &FbConfig, request: GlRequest) -> Result<GlContext> {
        if let Some(create) = self.create_context_attribs {
            let mut flags = 0;
            if request.debug {
                flags |= GLX_CONTEXT_DEBUG_BIT_ARB;
            }
            let attribs = [
                GLX_CONTEXT_MAJOR_VERSION_ARB, c_int::from(request.major),
                GLX_CONTEXT_MINOR_VERSION_ARB, c_int::from(request.minor),
                GLX_CONTEXT_FLAGS_ARB, flags,
                0,
            ];

            let (raw, error) = {
                let trap = ErrorTrap::install(self.xlib.XSetErrorHandler);
                let raw = unsafe { create(self.display, config.raw, ptr::null_mut(), 1, attribs.as_ptr()) };
                self.sync();
                (raw, trap.error_code())
            };

            if !raw.is_null() && error.is_none() {
                info!("Created GL {}.{} context (debug={})", request.major, request.minor, request.debug);
                return Ok(GlContext { raw });
            }
            if !raw.is_null() {
                unsafe { (self.glx.glXDestroyContext)(self.display, raw) };
            }
            warn!(
                "GL {}.{} context refused (X error {}), falling back to legacy context",
                request.major,
                request.minor,
                error.unwrap_or(0)
            );
        }

        let raw = unsafe {
            (self.glx.glXCreateNewContext)(
                self.display,
                config.raw,
                glx::GLX_RGBA_TYPE as c_int,
                ptr::null_mut(),
                1, // Direct
            )
        };
        if raw.is_null() {
            return Err(Error::Gl("glXCreateNewContext failed".into()));
        }
        info!("Created legacy GL context");
        Ok(GlContext { raw })
    }

    /// Xlib round trip; errors and events read meanwhile stay with XCB
    pub fn sync(&self) {
        unsafe { (self.xlib.XSync)(self.display, 0) };
    }

    pub fn make_current(&self, window: u32, context: &GlContext) -> bool {
        unsafe { (self.glx.glXMakeCurrent)(self.display, xlib::XID::from(window), context.raw) != 0 }
    }

    pub fn release_current(&self) {
        unsafe {
            (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
        }
    }

    pub fn swap_buffers(&self, window: u32) {
        unsafe { (self.glx.glXSwapBuffers)(self.display, xlib::XID::from(window)) };
    }

    pub fn destroy_context(&self, context: GlContext) {
        unsafe {
            if (self.glx.glXGetCurrentContext)() == context.raw {
                (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
            }
            (self.glx.glXDestroyContext)(self.display, context.raw);
        }
    }

    /// Address of a GL function, null when unknown
    pub fn proc_address(&self, name: &str) -> *const c_void {
        let Ok(name) = CString::new(name) else {
            return ptr::null();
        };
        let cname: &CStr = &name;
        unsafe {
            (self.glx.glXGetProcAddress)(cname.as_ptr() as *const _)
                .map_or(ptr::null(), |f| f as *const c_void)
        }
    }
}

impl Drop for GlDisplay {
    fn drop(&mut self) {
        debug!("Closing Xlib display");
        unsafe { (self.xlib.XCloseDisplay)(self.display) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static INSTALLED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn host_handler(_: *mut xlib::Display, _: *mut xlib::XErrorEvent) -> c_int {
        0
    }

    // stands in for XSetErrorHandler so no display is needed
    unsafe extern "C" fn swap_handler(handler: ErrorHandler) -> ErrorHandler {
        let new = handler.map_or(0, |f| f as usize);
        let old = INSTALLED.swap(new, Ordering::SeqCst);
        (old != 0).then(|| unsafe {
            std::mem::transmute::<usize, unsafe extern "C" fn(*mut xlib::Display, *mut xlib::XErrorEvent) -> c_int>(old)
        })
    }

    fn installed() -> usize {
        INSTALLED.load(Ordering::SeqCst)
    }

    #[test]
    fn test_error_trap_restores_host_handler() {
        unsafe { swap_handler(Some(host_handler)) };
        let host = host_handler as usize;
        assert_eq!(installed(), host);

        {
            let trap = ErrorTrap::install(swap_handler);
            assert_eq!(installed(), x_error_handler as usize);
            assert_eq!(trap.error_code(), None);

            let mut event: xlib::XErrorEvent = unsafe { std::mem::zeroed() };
            event.error_code = 8; // BadMatch
            unsafe { x_error_handler(ptr::null_mut(), &mut event) };
            event.error_code = 2;
            unsafe { x_error_handler(ptr::null_mut(), &mut event) };
            assert_eq!(trap.error_code(), Some(8));
        }
        assert_eq!(installed(), host);

        let trap = ErrorTrap::install(swap_handler);
        assert_eq!(trap.error_code(), None);
        drop(trap);
        assert_eq!(installed(), host);
    }
}
