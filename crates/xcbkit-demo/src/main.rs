//! xcbkit demo
//!
//! Opens a top-level window with a GL child that slowly cycles its clear
//! color. The toolkit runs its own loop by default; `--embed mio` and
//! `--embed tokio` drive it from a host loop instead. `--parent <xid>`
//! puts the GL window into an existing foreign window, the way a plugin
//! editor is embedded into a host.

use std::io::Read;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{ConfigureWindowAux, ConnectionExt as _};
use xcbkit::{
    Config, Connection, MioEmbed, Propagation, Rect, TimerId, TokioEmbed, WindowEvent, WindowId,
};

const FRAME_TIMER: TimerId = match TimerId::new(1) {
    Some(id) => id,
    None => panic!("timer ids are positive"),
};
const FRAME_INTERVAL: Duration = Duration::from_millis(16);
const STDIN_FD: RawFd = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Driver {
    Own,
    Mio,
    Tokio,
}

struct Options {
    driver: Driver,
    parent: Option<u32>,
    watch_stdin: bool,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        driver: Driver::Own,
        parent: None,
        watch_stdin: false,
    };
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--embed" => {
                options.driver = match iter.next().map(String::as_str) {
                    Some("none") => Driver::Own,
                    Some("mio") => Driver::Mio,
                    Some("tokio") => Driver::Tokio,
                    other => bail!("--embed expects none, mio or tokio, got {:?}", other),
                };
            }
            "--parent" => {
                let xid = iter.next().context("--parent expects a window id")?;
                let xid = match xid.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => xid.parse(),
                }
                .with_context(|| format!("invalid window id {xid:?}"))?;
                options.parent = Some(xid);
            }
            "--stdin" => options.watch_stdin = true,
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(options)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xcbkit=debug,xcbkit_demo=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--write-config") {
        let path = Config::config_path()?;
        Config::save_default(&path)?;
        return Ok(());
    }
    let options = parse_options(&args)?;

    let config = Config::load().unwrap_or_else(|err| {
        warn!("Failed to load config ({}), using defaults", err);
        Config::default()
    });

    info!("Starting xcbkit demo ({:?} loop)", options.driver);
    match options.driver {
        Driver::Own => run_own(&config, &options),
        Driver::Mio => run_mio(&config, &options),
        Driver::Tokio => run_tokio(&config, &options),
    }
}

/// Create the windows, install handlers and start the frame timer
fn setup(config: &Config, options: &Options, exit: &Arc<AtomicBool>) -> Result<Connection> {
    let mut conn = Connection::from_config(config).context("Failed to connect to X server")?;
    let size = Rect::sized(config.window.width, config.window.height);

    let (top, parent) = match options.parent {
        Some(parent) => (None, parent),
        None => {
            let screen = conn.default_screen();
            let top = conn.create_top_window(screen, Some(&config.window.title), size)?;
            (Some(top), top.xid())
        }
    };

    let scene = match conn.create_gl_window(parent, size.client(), config.gl.request()) {
        Ok(window) => Some(window),
        Err(err) if top.is_some() => {
            warn!("No GL window ({}), showing an empty top-level window", err);
            None
        }
        Err(err) => return Err(err).context("Failed to create GL window in foreign parent"),
    };

    if let Some(top) = top {
        let exit = exit.clone();
        conn.push_handler(top, move |conn: &mut Connection, window: WindowId, event: &WindowEvent| {
            if conn.is_close_request(event) {
                info!("Close requested for {}", window);
                exit.store(true, Ordering::Release);
                return Propagation::Stop;
            }
            match (scene, event) {
                (Some(scene), WindowEvent::Protocol(Event::ConfigureNotify(e))) => {
                    let aux = ConfigureWindowAux::new()
                        .width(u32::from(e.width))
                        .height(u32::from(e.height));
                    if let Err(err) = conn.xcb().configure_window(scene.xid(), &aux) {
                        warn!("Failed to resize GL window: {}", err);
                    }
                }
                (_, WindowEvent::Destroying) => exit.store(true, Ordering::Release),
                _ => {}
            }
            Propagation::Forward
        })?;
    }

    if let Some(scene) = scene {
        conn.draw_begin(scene)?;
        gl::load_with(|symbol| conn.gl_proc_address(symbol).unwrap_or(ptr::null()));
        conn.draw_stop(scene)?;

        let started = Instant::now();
        conn.push_handler(scene, move |conn: &mut Connection, window: WindowId, event: &WindowEvent| {
            match event {
                WindowEvent::Protocol(Event::Expose(e)) if e.count == 0 => {
                    if let Err(err) = draw_frame(conn, window, started) {
                        warn!("Redraw failed: {}", err);
                    }
                }
                WindowEvent::Destroying => {
                    let _ = conn.cancel_timer(FRAME_TIMER);
                }
                _ => {}
            }
            Propagation::Stop
        })?;
        schedule_frame(&mut conn, scene, started)?;
        conn.map_window(scene)?;
    }

    match top {
        Some(top) => conn.map_window(top)?,
        None => {
            if let Some(scene) = scene {
                conn.set_xembed_info(scene)?;
                conn.wait_mapped(scene)?;
                // the embedder learns the id only once the window is visible
                println!("{:#x}", scene.xid());
            }
        }
    }

    if options.watch_stdin {
        let exit = exit.clone();
        conn.watch_fd(STDIN_FD, move |conn: &mut Connection, fd: RawFd| {
            let mut buf = [0u8; 256];
            match std::io::stdin().read(&mut buf) {
                Ok(0) => {
                    debug!("stdin closed");
                    let _ = conn.unwatch_fd(fd);
                }
                Ok(n) if buf[..n].contains(&b'q') => exit.store(true, Ordering::Release),
                Ok(_) => {}
                Err(err) => {
                    warn!("Failed to read stdin: {}", err);
                    let _ = conn.unwatch_fd(fd);
                }
            }
        })?;
        info!("Type q and Enter to quit");
    }

    conn.flush()?;
    Ok(conn)
}

fn draw_frame(conn: &mut Connection, window: WindowId, started: Instant) -> xcbkit::Result<()> {
    let size = conn.window_rect(window).unwrap_or_default();
    conn.draw_begin(window)?;
    let t = started.elapsed().as_secs_f32();
    unsafe {
        gl::Viewport(0, 0, i32::from(size.width), i32::from(size.height));
        gl::ClearColor(0.5 + 0.5 * t.sin(), 0.5 + 0.5 * (t * 0.7).sin(), 0.6, 1.0);
        gl::Clear(gl::COLOR_BUFFER_BIT);
    }
    conn.draw_end(window)?;
    Ok(())
}

fn schedule_frame(conn: &mut Connection, window: WindowId, started: Instant) -> xcbkit::Result<()> {
    conn.set_timer(FRAME_TIMER, FRAME_INTERVAL, move |conn: &mut Connection, _: TimerId| {
        if conn.is_mapped(window) {
            if let Err(err) = draw_frame(conn, window, started) {
                warn!("Frame failed, stopping animation: {}", err);
                return;
            }
        }
        if let Err(err) = schedule_frame(conn, window, started) {
            warn!("Failed to schedule next frame: {}", err);
        }
    })
}

fn run_own(config: &Config, options: &Options) -> Result<()> {
    let exit = Arc::new(AtomicBool::new(false));
    let mut conn = setup(config, options, &exit)?;
    conn.event_loop(Some(&exit))?;
    conn.disconnect()?;
    Ok(())
}

fn run_mio(config: &Config, options: &Options) -> Result<()> {
    let exit = Arc::new(AtomicBool::new(false));
    let mut conn = setup(config, options, &exit)?;

    let mut poll = mio::Poll::new().context("Failed to create mio Poll")?;
    let mut events = mio::Events::with_capacity(16);
    let (embed, handle) = MioEmbed::new(poll.registry(), mio::Token(0))?;
    conn.set_embed(Some(Box::new(embed)))?;
    // registrations are edge triggered; pick up whatever is already queued
    conn.process()?;

    while !exit.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, handle.timeout()) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("mio poll failed");
        }
        if handle.should_process(&events) {
            conn.process()?;
        }
    }

    conn.set_embed(None)?;
    conn.disconnect()?;
    Ok(())
}

fn run_tokio(config: &Config, options: &Options) -> Result<()> {
    // Connection is not Send; keep everything on one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let exit = Arc::new(AtomicBool::new(false));
        let mut conn = setup(config, options, &exit)?;
        let (embed, handle) = TokioEmbed::new();
        conn.set_embed(Some(Box::new(embed)))?;
        conn.process()?;

        while !exit.load(Ordering::Acquire) {
            tokio::select! {
                _ = handle.wait() => {
                    conn.process()?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
            }
        }

        conn.set_embed(None)?;
        conn.disconnect()?;
        Ok::<_, anyhow::Error>(())
    })
}
