//! The PTY pump: reads child output, drives the state machine under the
//! fabric's rendezvous protocol, mirrors stdio in pipe mode and services
//! the debug sink.

use std::io::Write;
use std::sync::Arc;

use super::pty::Pty;
use super::Term;

const READ_CHUNK: usize = 4096;
const POLL_TICK_MS: i32 = 10;

/// One read attempt. `Ok(None)` means nothing available right now;
/// `Err(())` means the PTY is gone and the terminal should wind down.
fn flush_buffer(pty: &Pty, buf: &mut [u8]) -> Result<Option<usize>, ()> {
    match pty.read(buf) {
        Ok(0) => Err(()),
        Ok(n) => Ok(Some(n)),
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::Interrupted =>
        {
            Ok(None)
        }
        Err(err) => {
            log::info!("pty read failed: {}", err);
            Err(())
        }
    }
}

fn poll_in(fd: i32, timeout_ms: i32) -> bool {
    let mut pfd = [libc::pollfd { fd, events: libc::POLLIN, revents: 0 }];
    unsafe { libc::poll(pfd.as_mut_ptr(), 1, timeout_ms) == 1 }
}

/// Feed one chunk to the machine, mirroring to stdout in pipe mode.
fn forward(term: &Term, vt: &mut crate::vt::Vt, bytes: &[u8]) {
    if term.pipe {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
    vt.input(bytes);
}

/// The central readout pass: grab the machine (with the wakeup handshake
/// when the render loop holds it), forward what arrived, then drain
/// whatever else is pending, bounded so a chatty child cannot hold the
/// lock hostage.
fn readout(term: &Term, pty: &Pty) -> bool {
    let mut buf = [0u8; READ_CHUNK];
    let mut nr = match flush_buffer(pty, &mut buf) {
        Ok(Some(n)) => n,
        Ok(None) => return true,
        Err(()) => return false,
    };

    let (mut vt, flagged) = term.fabric.pump_lock_vt();
    forward(term, &mut vt, &buf[..nr]);

    let (cols, rows) = vt.dimensions();
    let mut cap = cols as i64 * rows as i64 * 4;
    let mut ok = true;
    while nr > 0 && cap > 0 && poll_in(pty.fd(), 0) {
        match flush_buffer(pty, &mut buf) {
            Ok(Some(n)) => {
                forward(term, &mut vt, &buf[..n]);
                cap -= n as i64;
                nr = n;
            }
            Ok(None) => break,
            Err(()) => {
                ok = false;
                break;
            }
        }
    }

    // Machine responses ride back to the child before the lock drops so
    // they cannot interleave with render-side input
    let writeback = vt.take_writeback();
    if !writeback.is_empty() {
        if let Err(err) = pty.write(&writeback) {
            log::warn!("writeback failed: {}", err);
            ok = false;
        }
    }

    drop(vt);
    term.fabric.pump_done(flagged);
    ok
}

/// Service the debug subwindow: absorb its request bytes, answer with a
/// state snapshot.
fn drain_debug(term: &Term) {
    let mut win = term.debug_win().lock();
    let Some(stream) = win.as_mut() else { return };

    let mut req = [0u8; 256];
    use std::io::Read;
    match stream.read(&mut req) {
        Ok(0) => {
            drop(win);
            log::info!("debug subwindow closed");
            term.unbind_debug();
            return;
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(err) => {
            drop(win);
            log::warn!("debug subwindow read failed: {}", err);
            term.unbind_debug();
            return;
        }
    }

    let snapshot = {
        let (mut vt, flagged) = term.fabric.pump_lock_vt();
        let vt = &mut *vt;
        let text = vt.debug.render(&vt.surface);
        term.fabric.pump_done(flagged);
        text
    };
    if let Err(err) = stream.write_all(snapshot.as_bytes()) {
        drop(win);
        log::warn!("debug subwindow write failed: {}", err);
        term.unbind_debug();
    }
}

/// Pump thread body. Exits when the terminal dies, the PTY goes away, or a
/// hard reset replaced this pump's PTY with a fresh one.
pub fn run(term: Arc<Term>, pty: Arc<Pty>) {
    let mut stdin_buf = [0u8; READ_CHUNK];

    while term.alive() {
        // A hard reset swaps the PTY out underneath us (the replacement
        // pump owns the new one); a SIGHUP detach leaves the slot empty
        // and ends the terminal
        match term.pty() {
            Some(cur) if Arc::ptr_eq(&cur, &pty) => {}
            Some(_) => {
                log::debug!("pump superseded, exiting");
                return;
            }
            None => break,
        }

        pty.dispatch();

        let debug_fd = term.debug_fd();
        let stdin_fd = if term.pipe { libc::STDIN_FILENO } else { -1 };
        let pollev = libc::POLLIN | libc::POLLERR | libc::POLLNVAL | libc::POLLHUP;
        let mut set = [
            libc::pollfd { fd: pty.fd(), events: pollev, revents: 0 },
            libc::pollfd { fd: term.fabric.pump_wake_fd(), events: pollev, revents: 0 },
            libc::pollfd { fd: debug_fd, events: pollev, revents: 0 },
            libc::pollfd { fd: stdin_fd, events: libc::POLLIN, revents: 0 },
        ];

        let rc = unsafe { libc::poll(set.as_mut_ptr(), set.len() as libc::nfds_t, POLL_TICK_MS) };
        if rc < 0 {
            continue;
        }

        if term.pipe && set[3].revents != 0 {
            let nr = unsafe {
                libc::read(
                    libc::STDIN_FILENO,
                    stdin_buf.as_mut_ptr() as *mut libc::c_void,
                    stdin_buf.len(),
                )
            };
            if nr > 0 {
                let _ = pty.write(&stdin_buf[..nr as usize]);
            }
        }

        // The tty determines the lifecycle
        if set[0].revents != 0 && !readout(&term, &pty) {
            break;
        }

        if set[1].revents != 0 {
            term.fabric.pump_drain_wake();
        }

        if set[2].revents != 0 {
            drain_debug(&term);
        }
    }

    // A replacement pump spawned by a hard reset keeps the terminal
    // alive; in every other exit the terminal is done
    let superseded = term.pty().map_or(false, |cur| !Arc::ptr_eq(&cur, &pty));
    if !superseded {
        term.set_alive(false);
    }
    // Kick the render loop so it notices promptly (cursor hide, completion
    // marker)
    term.fabric.poke_render();
    log::info!("pump thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::pty::open_pair;
    use crate::term::sync::Fabric;
    use crate::vt::Vt;
    use rustix::io::write as fd_write;

    fn term_with(cols: u16, rows: u16) -> Arc<Term> {
        Arc::new(Term::new(Fabric::new(Vt::new(cols, rows)).unwrap(), false))
    }

    #[test]
    fn readout_feeds_bytes_in_order() {
        let term = term_with(40, 5);
        let (master, slave) = open_pair(40, 5).unwrap();
        let pty = Pty::new(master, -1);
        fd_write(&slave, b"hello").unwrap();
        assert!(poll_in(pty.fd(), 1000));
        assert!(readout(&term, &pty));
        assert_eq!(term.fabric.lock_vt().surface.row_text(0), "hello");
    }

    #[test]
    fn readout_drains_multiple_chunks() {
        let term = term_with(80, 10);
        let (master, slave) = open_pair(80, 10).unwrap();
        let pty = Pty::new(master, -1);
        fd_write(&slave, b"one ").unwrap();
        fd_write(&slave, b"two").unwrap();
        assert!(poll_in(pty.fd(), 1000));
        assert!(readout(&term, &pty));
        assert_eq!(term.fabric.lock_vt().surface.row_text(0), "one two");
    }

    #[test]
    fn readout_flushes_machine_responses() {
        let term = term_with(40, 5);
        let (master, slave) = open_pair(40, 5).unwrap();
        // Line discipline off so the response can be read back byte-wise
        let mut tio = rustix::termios::tcgetattr(&slave).unwrap();
        tio.make_raw();
        rustix::termios::tcsetattr(&slave, rustix::termios::OptionalActions::Now, &tio).unwrap();
        let pty = Pty::new(master, -1);
        // DA1 query: the answer must land on the pty without render help
        fd_write(&slave, b"\x1b[c").unwrap();
        assert!(poll_in(pty.fd(), 1000));
        assert!(readout(&term, &pty));
        let mut buf = [0u8; 32];
        let n = rustix::io::read(&slave, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x1b[?62;22c");
    }

    #[test]
    fn readout_reports_closed_pty() {
        let term = term_with(40, 5);
        let (master, slave) = open_pair(40, 5).unwrap();
        let pty = Pty::new(master, -1);
        drop(slave);
        // All slave ends gone: the master read errors out
        assert!(poll_in(pty.fd(), 1000));
        assert!(!readout(&term, &pty));
    }

    #[test]
    fn idle_pty_is_not_fatal() {
        let term = term_with(40, 5);
        let (master, _slave) = open_pair(40, 5).unwrap();
        let pty = Pty::new(master, -1);
        assert!(readout(&term, &pty));
    }
}
