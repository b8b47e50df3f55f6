// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-wide shutdown signalling.
//!
//! Workers block in `poll(2)` on their connection plus the read end of
//! this pipe; a single byte written to it wakes every poller at once.
//! The write end is stashed in a static so the signal handler can reach
//! it with nothing but an `async-signal-safe` write.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static CANCEL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Outcome of waiting for readability against the cancel pipe.
pub enum Wait {
    Readable,
    Canceled,
    Gone,
}

/// Block until `fd` is readable or `cancel_fd` fires.
#[must_use]
pub fn wait_readable(fd: RawFd, cancel_fd: RawFd) -> Wait {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: cancel_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::warn!("poll failed: {err}");
            return Wait::Gone;
        }
        if fds[1].revents & libc::POLLIN != 0 {
            return Wait::Canceled;
        }
        if fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            // On HUP the next read observes EOF and the caller tears down.
            return Wait::Readable;
        }
    }
}

pub struct CancelPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl CancelPipe {
    /// Create the pipe. The read end stays blocking; pollers only ever
    /// test it for readability.
    ///
    /// # Errors
    ///
    /// The `pipe(2)` errno as an `std::io::Error`.
    pub fn new() -> std::io::Result<CancelPipe> {
        let mut fds = [0_i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(CancelPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    #[must_use]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wake every poller. Safe to call more than once.
    pub fn cancel(&self) {
        let byte = [0_u8; 1];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr().cast(), 1);
        }
    }

    /// Route SIGINT and SIGTERM into this pipe.
    pub fn install_signal_handlers(&self) {
        CANCEL_WRITE_FD.store(self.write_fd, Ordering::SeqCst);
        let handler = handle_signal as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        }
    }
}

impl Drop for CancelPipe {
    fn drop(&mut self) {
        CANCEL_WRITE_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .ok();
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

extern "C" fn handle_signal(_signum: libc::c_int) {
    let fd = CANCEL_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0_u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}
