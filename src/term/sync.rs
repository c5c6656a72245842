//! Rendezvous between the pump thread and the render loop. One mutex
//! guards the state machine; a condvar-backed turnstile lets the render
//! loop wait out a pump pass it was woken for; the socketpair is a pure
//! wakeup channel in both directions (contents ignored, drained in 256
//! byte gulps).

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::vt::Vt;

const DRAIN_CHUNK: usize = 256;

pub struct Fabric {
    vt: Mutex<Vt>,
    busy: Mutex<bool>,
    done: Condvar,
    /// Pump-side end: poked when the pump found the lock taken, drained to
    /// absorb render-side wakeups.
    dirty: OwnedFd,
    /// Render-side end: handed to the display poll as a wake source.
    signal: OwnedFd,
}

impl Fabric {
    pub fn new(vt: Vt) -> std::io::Result<Self> {
        let mut pair = [0i32; 2];
        // Non-blocking so drains are safe even on a spurious ack
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                pair.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (dirty, signal) = unsafe {
            (OwnedFd::from_raw_fd(pair[0]), OwnedFd::from_raw_fd(pair[1]))
        };
        Ok(Fabric {
            vt: Mutex::new(vt),
            busy: Mutex::new(false),
            done: Condvar::new(),
            dirty,
            signal,
        })
    }

    pub fn lock_vt(&self) -> MutexGuard<'_, Vt> {
        self.vt.lock()
    }

    /// Pump-side acquisition. When the render loop holds the lock, flag the
    /// pass, poke the render wake channel, then block until the lock frees.
    /// The returned bool must be handed back to [`Fabric::pump_done`].
    pub fn pump_lock_vt(&self) -> (MutexGuard<'_, Vt>, bool) {
        if let Some(guard) = self.vt.try_lock() {
            return (guard, false);
        }
        *self.busy.lock() = true;
        self.poke_render();
        (self.vt.lock(), true)
    }

    /// Pump-side release of a flagged pass: wake the render loop's ack wait.
    pub fn pump_done(&self, flagged: bool) {
        if !flagged {
            return;
        }
        let mut busy = self.busy.lock();
        *busy = false;
        self.done.notify_all();
    }

    /// Render-side ack after a wake: drain the wake bytes, then wait for
    /// the pump's in-flight pass to finish so the next lock round starts
    /// from a settled state machine.
    pub fn render_ack(&self) {
        drain(&self.signal);
        let mut busy = self.busy.lock();
        while *busy {
            if self
                .done
                .wait_for(&mut busy, Duration::from_millis(250))
                .timed_out()
            {
                log::warn!("pump pass still in flight after ack timeout");
            }
        }
    }

    /// Poke the pump's poll loop (subwindow grants, shutdown nudges).
    pub fn wake_pump(&self) {
        let _ = rustix::io::write(&self.signal, b"1");
    }

    pub fn poke_render(&self) {
        let _ = rustix::io::write(&self.dirty, b"1");
    }

    pub fn pump_drain_wake(&self) {
        drain(&self.dirty);
    }

    /// Descriptor the pump adds to its poll set.
    pub fn pump_wake_fd(&self) -> RawFd {
        self.dirty.as_raw_fd()
    }

    /// Descriptor the render loop hands to the display poll.
    pub fn render_wake_fd(&self) -> RawFd {
        self.signal.as_raw_fd()
    }
}

fn drain(fd: &OwnedFd) {
    let mut buf = [0u8; DRAIN_CHUNK];
    let _ = rustix::io::read(fd, &mut buf);
}
