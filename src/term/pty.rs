//! PTY master wrapper: lifecycle of the descriptor and the child process
//! group behind it. Spawning itself lives in `crate::shell`.

use parking_lot::Mutex;
use rustix::termios::{self, Winsize};
use rustix_openpty::openpty;
use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use super::quarantine;

/// Open a master/slave pair with the given initial geometry.
pub fn open_pair(cols: u16, rows: u16) -> std::io::Result<(OwnedFd, OwnedFd)> {
    let pair = openpty(None, None)?;
    let master = pair.controller;
    let slave = pair.user;
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let _ = termios::tcsetwinsize(master.as_fd(), winsize);
    Ok((master, slave))
}

pub struct Pty {
    master: OwnedFd,
    child: libc::pid_t,
    // Input from the render thread and machine write-backs from the pump
    // must not interleave mid-chunk
    write_lock: Mutex<()>,
    child_exited: AtomicBool,
}

impl Pty {
    /// Wrap a master descriptor. `child < 0` means no process is attached
    /// (tests, post-mortem holds); signal and reap calls become no-ops.
    pub fn new(master: OwnedFd, child: libc::pid_t) -> Self {
        // Non-blocking master so the bounded drain loop cannot stall
        unsafe {
            let flags = libc::fcntl(master.as_raw_fd(), libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(master.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Pty {
            master,
            child,
            write_lock: Mutex::new(()),
            child_exited: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn child(&self) -> libc::pid_t {
        self.child
    }

    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        rustix::io::read(&self.master, buf).map_err(std::io::Error::from)
    }

    /// Write the whole chunk, serialized against concurrent writers.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut rest = bytes;
        while !rest.is_empty() {
            match rustix::io::write(&self.master, rest) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "pty write returned 0",
                    ));
                }
                Ok(n) => rest = &rest[n..],
                Err(rustix::io::Errno::AGAIN) => {
                    let mut pfd = [libc::pollfd {
                        fd: self.master.as_raw_fd(),
                        events: libc::POLLOUT,
                        revents: 0,
                    }];
                    unsafe { libc::poll(pfd.as_mut_ptr(), 1, 100) };
                }
                Err(rustix::io::Errno::INTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        log::debug!("pty resize: pid={}, cols={}, rows={}", self.child, cols, rows);
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let _ = termios::tcsetwinsize(self.master.as_fd(), winsize);
    }

    pub fn signal(&self, sig: libc::c_int) {
        if self.child <= 0 {
            return;
        }
        unsafe {
            libc::kill(self.child, sig);
        }
    }

    /// Reap the child if it exited. Called once per pump turn.
    pub fn dispatch(&self) -> bool {
        if self.child <= 0 {
            return false;
        }
        if self.child_exited.load(Ordering::Acquire) {
            return true;
        }
        let mut status = 0;
        let rc = unsafe { libc::waitpid(self.child, &mut status, libc::WNOHANG) };
        if rc == self.child {
            log::info!("child {} exited, status {}", self.child, status);
            self.child_exited.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn child_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    /// Teardown used by the SIGHUP path: dispose of the master with a
    /// forensics tag if close misbehaves. The child is left to its own
    /// SIGHUP from the session teardown.
    pub fn close(self) {
        let fd = self.master.as_raw_fd();
        // Keep OwnedFd from double-closing
        let _this = std::mem::ManuallyDrop::new(self);
        quarantine::close_or_quarantine(fd, "pty-master");
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if self.child > 0 && !self.child_exited.load(Ordering::Acquire) {
            unsafe {
                libc::kill(self.child, libc::SIGHUP);
                libc::waitpid(self.child, std::ptr::null_mut(), libc::WNOHANG);
            }
        }
    }
}
