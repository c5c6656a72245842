//! The terminal frameserver core: one child shell behind a PTY, one display
//! connection, a pump thread feeding the state machine and the render loop
//! owning everything else.

pub mod pty;
pub mod pump;
pub mod quarantine;
pub mod sync;

use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::args::TermArgs;
use crate::display::proto::{ColorSlot, HostEvent, SubwindowKind};
use crate::display::Screen;
use crate::shell;
use crate::vt::keys::Mods;
use crate::vt::palette::{COLOR_BACKGROUND, COLOR_FOREGROUND};
use crate::vt::Vt;
use pty::Pty;
use sync::Fabric;

/// Shared terminal context. The render loop borrows it; the pump thread
/// owns a clone of the `Arc`. Apart from the fabric-guarded state machine,
/// the only shared mutables are the atomics and the slots below.
pub struct Term {
    pub fabric: Fabric,
    pty: Mutex<Option<Arc<Pty>>>,
    alive: AtomicBool,
    pub pipe: bool,
    debug_win: Mutex<Option<UnixStream>>,
    debug_fd: AtomicI32,
    last_input: Mutex<Instant>,
}

impl Term {
    pub fn new(fabric: Fabric, pipe: bool) -> Self {
        Term {
            fabric,
            pty: Mutex::new(None),
            alive: AtomicBool::new(false),
            pipe,
            debug_win: Mutex::new(None),
            debug_fd: AtomicI32::new(-1),
            last_input: Mutex::new(Instant::now()),
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn pty(&self) -> Option<Arc<Pty>> {
        self.pty.lock().clone()
    }

    pub fn set_pty(&self, pty: Arc<Pty>) {
        *self.pty.lock() = Some(pty);
    }

    /// Detach the PTY; no further reads or writes happen once every holder
    /// of the old handle lets go.
    pub fn take_pty(&self) -> Option<Arc<Pty>> {
        self.pty.lock().take()
    }

    pub fn bind_debug(&self, stream: UnixStream) {
        use std::os::fd::AsRawFd;
        self.debug_fd.store(stream.as_raw_fd(), Ordering::Release);
        *self.debug_win.lock() = Some(stream);
    }

    pub fn unbind_debug(&self) {
        self.debug_fd.store(-1, Ordering::Release);
        *self.debug_win.lock() = None;
    }

    pub fn debug_fd(&self) -> RawFd {
        self.debug_fd.load(Ordering::Acquire)
    }

    pub fn debug_win(&self) -> &Mutex<Option<UnixStream>> {
        &self.debug_win
    }

    pub fn touch_input(&self) {
        *self.last_input.lock() = Instant::now();
    }

    /// Advisory idle measure for the host side.
    pub fn idle_for(&self) -> Duration {
        self.last_input.lock().elapsed()
    }
}

/// Render-thread-only lifecycle flags: whether child death ends the
/// process, and the once-per-cycle latches around it.
pub struct Lifecycle {
    die_on_term: bool,
    complete_signal: bool,
    cursor_hidden: bool,
}

impl Lifecycle {
    pub fn new(keep_alive: bool) -> Self {
        Lifecycle {
            die_on_term: !keep_alive,
            complete_signal: false,
            cursor_hidden: false,
        }
    }

    pub fn keep_running(&self, alive: bool) -> bool {
        alive || !self.die_on_term
    }

    pub fn die_on_term(&self) -> bool {
        self.die_on_term
    }

    /// Fresh execution cycle: clear both latches.
    pub fn on_cycle_start(&mut self) {
        self.complete_signal = false;
        self.cursor_hidden = false;
    }

    /// True exactly once per cycle, when a kept-alive terminal's child has
    /// died and the completion marker is still owed.
    pub fn should_emit_complete(&mut self, alive: bool) -> bool {
        if !alive && !self.die_on_term && !self.complete_signal {
            self.complete_signal = true;
            true
        } else {
            false
        }
    }

    pub fn should_hide_cursor(&mut self, alive: bool) -> bool {
        if !alive && !self.cursor_hidden {
            self.cursor_hidden = true;
            true
        } else {
            false
        }
    }
}

// SIGHUP is delivered through a self-pipe and handled by the render loop
// in normal context.
static SIGHUP_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sighup(_sig: libc::c_int) {
    let fd = SIGHUP_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"h".as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn install_sighup_pipe() -> Result<RawFd> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("sighup pipe");
    }
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    SIGHUP_PIPE_WR.store(fds[1], Ordering::Relaxed);
    unsafe {
        libc::signal(libc::SIGHUP, on_sighup as libc::sighandler_t);
    }
    Ok(fds[0])
}

#[cfg(target_os = "openbsd")]
fn pledge_terminal() {
    let promises = b"stdio rpath wpath cpath unix sendfd recvfd proc exec tty\0";
    unsafe {
        libc::pledge(promises.as_ptr() as *const libc::c_char, std::ptr::null());
    }
}

#[cfg(not(target_os = "openbsd"))]
fn pledge_terminal() {}

/// Open the PTY, fork the shell, start the pump. Shared between startup
/// and the hard-reset respawn path.
pub fn build_term(term: &Arc<Term>, args: &TermArgs, cols: u16, rows: u16) -> Result<()> {
    let pty = Arc::new(shell::spawn(args, cols, rows).context("spawning shell")?);
    term.set_pty(pty.clone());
    term.set_alive(true);
    let pump_term = term.clone();
    std::thread::Builder::new()
        .name("pty-pump".into())
        .spawn(move || pump::run(pump_term, pty))
        .context("spawning pump thread")?;
    Ok(())
}

/// Frameserver entry: wire up the display, the state machine and the child,
/// then run the render loop until the display goes away or the terminal is
/// done.
pub fn run(args: TermArgs) -> Result<()> {
    if args.cli {
        bail!("cli mode is a separate frameserver, not built here");
    }
    if args.tpack {
        std::env::set_var("TUI_RPACK", "1");
    }

    let mut screen = Screen::connect("frameterm", args.tpack).context("display setup")?;
    let (cols, rows) = screen.dimensions();

    let mut vt = Vt::new(cols, rows);
    if let Some(name) = &args.palette {
        vt.set_palette(name);
    }
    for (index, color) in &args.palette_overrides {
        vt.set_color(*index, [color[0], color[1], color[2]]);
    }
    if let Some(c) = args.fg_color {
        vt.set_color(COLOR_FOREGROUND, [c[0], c[1], c[2]]);
    }
    if let Some(c) = args.bg_color {
        vt.set_color(COLOR_BACKGROUND, [c[0], c[1], c[2]]);
    }

    // Mirror the machine's idea of fg/bg onto the display, with the alpha
    // override folded into the background slot
    if let Some(bg) = vt.get_color(COLOR_BACKGROUND) {
        screen.set_color(ColorSlot::Background, bg, args.bg_alpha)?;
    }
    if let Some(fg) = vt.get_color(COLOR_FOREGROUND) {
        screen.set_color(ColorSlot::Foreground, fg, None)?;
    }
    if let Some(c) = args.cursor_color {
        screen.set_color(ColorSlot::Cursor, [c[0], c[1], c[2]], None)?;
    }
    if let Some(c) = args.cursor_alt_color {
        screen.set_color(ColorSlot::CursorAlt, [c[0], c[1], c[2]], None)?;
    }
    if let Some(style) = args.cursor {
        screen.cursor_config(style, args.blink_ticks)?;
    }

    let lifecycle = Lifecycle::new(args.keep_alive);
    if args.keep_alive {
        screen.progress(0.0)?;
    }

    let hup_fd = install_sighup_pipe()?;
    let term = Arc::new(Term::new(
        Fabric::new(vt).context("socketpair for thread wakeups")?,
        args.pipe,
    ));
    build_term(&term, &args, cols, rows)?;
    pledge_terminal();

    let mut renderer = Renderer { screen, term, args, lifecycle, hup_fd };
    renderer.run()
}

struct Renderer {
    screen: Screen,
    term: Arc<Term>,
    args: TermArgs,
    lifecycle: Lifecycle,
    hup_fd: RawFd,
}

impl Renderer {
    fn run(&mut self) -> Result<()> {
        let wake_fd = self.term.fabric.render_wake_fd();
        while self.lifecycle.keep_running(self.term.alive()) {
            let res = match self.screen.process(&[wake_fd, self.hup_fd], -1) {
                Ok(res) => res,
                Err(err) => {
                    log::warn!("display process failed: {}", err);
                    break;
                }
            };
            if res.dead {
                log::info!("display connection ended");
                break;
            }
            if res.ready.get(1).copied().unwrap_or(false) {
                self.on_sighup_pipe();
            }

            {
                let term = self.term.clone();
                let mut vt = term.fabric.lock_vt();
                for ev in res.events {
                    self.dispatch(&mut vt, ev);
                }
                if self.lifecycle.should_hide_cursor(self.term.alive()) {
                    let _ = self.screen.hide_cursor();
                }
                if self.lifecycle.should_emit_complete(self.term.alive()) {
                    let _ = self.screen.progress(1.0);
                }
                if let Some(title) = vt.take_title() {
                    let _ = self.screen.ident(&title);
                }
                if let Err(err) = self.screen.refresh(&mut vt.surface) {
                    log::warn!("refresh failed: {}", err);
                    break;
                }
            }

            // The pump poked us: drain the wake bytes and let its pass
            // settle before the next lock round
            if res.ready.first().copied().unwrap_or(false) {
                self.term.fabric.render_ack();
            }
        }
        Ok(())
    }

    fn on_sighup_pipe(&mut self) {
        let mut buf = [0u8; 16];
        unsafe {
            libc::read(self.hup_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
        log::info!("SIGHUP: detaching pty");
        if let Some(pty) = self.term.take_pty() {
            if let Ok(pty) = Arc::try_unwrap(pty) {
                pty.close();
            }
        }
    }

    /// Write child-bound bytes, downgrading the terminal on failure.
    fn write_pty(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let Some(pty) = self.term.pty() else { return };
        if let Err(err) = pty.write(bytes) {
            log::warn!("pty write failed: {}", err);
            self.term.set_alive(false);
        }
    }

    fn flush_writeback(&mut self, vt: &mut Vt) {
        let bytes = vt.take_writeback();
        self.write_pty(&bytes);
    }

    fn dispatch(&mut self, vt: &mut Vt, ev: HostEvent) {
        match ev {
            HostEvent::Key { keysym, mods, subid } => {
                self.term.touch_input();
                vt.keyboard(keysym, Mods::from_bits_truncate(mods), subid);
                self.flush_writeback(vt);
            }
            HostEvent::Utf8 { text } => {
                self.term.touch_input();
                self.write_pty(text.as_bytes());
            }
            HostEvent::Paste { text } => {
                vt.paste(text.as_bytes());
                self.flush_writeback(vt);
            }
            HostEvent::MouseMotion { x, y, mods, relative } => {
                // Only absolute positions make sense for cell addressing
                if !relative && x >= 0 && y >= 0 {
                    self.term.touch_input();
                    vt.mouse_motion(x as u16, y as u16, Mods::from_bits_truncate(mods));
                    self.flush_writeback(vt);
                }
            }
            HostEvent::MouseButton { x, y, button, active, mods } => {
                if x >= 0 && y >= 0 {
                    self.term.touch_input();
                    vt.mouse_button(
                        x as u16,
                        y as u16,
                        button,
                        active,
                        Mods::from_bits_truncate(mods),
                    );
                    self.flush_writeback(vt);
                }
            }
            HostEvent::Resize { cols, rows } => {
                if let Some(pty) = self.term.pty() {
                    pty.resize(cols, rows);
                }
                vt.surface.resize(cols, rows);
                self.screen.on_resized(cols, rows);
            }
            HostEvent::Reset { level } => self.on_reset(vt, level),
            HostEvent::ExecState { state } => {
                let sig = match state {
                    0 => libc::SIGCONT,
                    1 => libc::SIGSTOP,
                    2 => libc::SIGHUP,
                    other => {
                        log::warn!("unknown exec state {}", other);
                        return;
                    }
                };
                if let Some(pty) = self.term.pty() {
                    pty.signal(sig);
                }
            }
            HostEvent::Subwindow { id, kind } => self.on_subwindow(id, kind),
            HostEvent::Hello { cols, rows } => {
                // Late geometry renegotiation, treat like a resize
                if let Some(pty) = self.term.pty() {
                    pty.resize(cols, rows);
                }
                vt.surface.resize(cols, rows);
                self.screen.on_resized(cols, rows);
            }
            HostEvent::Bye => {}
        }
    }

    fn on_subwindow(&mut self, id: u32, kind: SubwindowKind) {
        // Only debug windows are honored; everything else was never
        // requested by us
        if kind != SubwindowKind::Debug {
            log::info!("declining subwindow {:?}", kind);
            return;
        }
        match self.screen.map_subwindow(id) {
            Ok(stream) => {
                self.term.bind_debug(stream);
                // Unblock the pump's poll so it picks the sink up
                self.term.fabric.wake_pump();
            }
            Err(err) => log::warn!("mapping debug subwindow failed: {}", err),
        }
    }

    fn on_reset(&mut self, vt: &mut Vt, level: u8) {
        match level {
            // Soft: display and state machine back to square one
            0 => {
                let _ = self.screen.reset();
                vt.hard_reset();
            }
            // Hard: soft reset, hang up the child, run a fresh one
            1 => {
                let _ = self.screen.reset();
                vt.hard_reset();
                if self.term.alive() {
                    if let Some(pty) = self.term.pty() {
                        pty.signal(libc::SIGHUP);
                    }
                    self.term.set_alive(false);
                }
                if !self.lifecycle.die_on_term() {
                    let _ = self.screen.progress(0.0);
                }
                self.term.take_pty();
                self.lifecycle.on_cycle_start();
                let (cols, rows) = vt.dimensions();
                if let Err(err) = build_term(&self.term, &self.args, cols, rows) {
                    log::warn!("respawn failed: {}", err);
                }
            }
            // Crash recovery: nothing sensible to do for a terminal
            _ => {}
        }
    }
}
