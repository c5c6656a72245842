//! Descriptor disposal with a forensics trail. A close that keeps failing
//! is not retried forever: the descriptor is deliberately leaked and
//! registered so a post-mortem can name it.

use parking_lot::Mutex;
use std::io::ErrorKind;
use std::os::fd::RawFd;

const CLOSE_RETRIES: usize = 10;

static LEAKED: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Close `fd`, retrying transient failures. On persistent failure the
/// descriptor is leaked on purpose and tagged `broken_fd(<fd>:<tag>)`.
pub fn close_or_quarantine(fd: RawFd, tag: &str) {
    for _ in 0..CLOSE_RETRIES {
        let rc = unsafe { libc::close(fd) };
        if rc == 0 {
            return;
        }
        let err = std::io::Error::last_os_error();
        // EBADF means it is already gone; nothing left to leak
        if err.raw_os_error() == Some(libc::EBADF) {
            return;
        }
        if err.kind() != ErrorKind::Interrupted {
            break;
        }
    }
    let entry = format!("broken_fd({}:{})", fd, tag);
    log::warn!("descriptor quarantined: {}", entry);
    LEAKED.lock().push(entry);
}

/// Snapshot of every quarantined descriptor tag.
pub fn leaked() -> Vec<String> {
    LEAKED.lock().clone()
}

#[cfg(test)]
pub fn quarantine_for_test(fd: RawFd, tag: &str) {
    let entry = format!("broken_fd({}:{})", fd, tag);
    LEAKED.lock().push(entry);
}
