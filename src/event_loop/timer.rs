//! Timer descriptors
//!
//! A [`TimerFd`] wraps a Linux `timerfd` on the monotonic clock. It becomes
//! readable when it expires and reading it yields the number of expirations
//! since the last read. The descriptor is non-blocking, so a read after a
//! spurious wake-up returns `None` instead of blocking the loop.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Monotonic one-shot or periodic timer descriptor.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: timerfd_create returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Arms the timer to fire after `value`, then every `interval` if given.
    /// A zero `value` is bumped to one nanosecond, since zero disarms.
    pub fn arm(&self, value: Duration, interval: Option<Duration>) -> io::Result<()> {
        let value = if value.is_zero() {
            Duration::from_nanos(1)
        } else {
            value
        };
        let spec = libc::itimerspec {
            it_value: timespec(value),
            it_interval: timespec(interval.unwrap_or_default()),
        };
        self.settime(&spec)
    }

    pub fn disarm(&self) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_value: timespec(Duration::ZERO),
            it_interval: timespec(Duration::ZERO),
        };
        self.settime(&spec)
    }

    fn settime(&self, spec: &libc::itimerspec) -> io::Result<()> {
        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, spec, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reads and clears the expiration count. `Ok(None)` if the timer has
    /// not expired since the last read.
    pub fn read(&self) -> io::Result<Option<u64>> {
        let mut expirations: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut expirations as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if n == std::mem::size_of::<u64>() as isize {
                return Ok(Some(expirations));
            }
            if n >= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read from timerfd",
                ));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    /// Another handle to the same kernel timer.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }
}

impl AsFd for TimerFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn unarmed_timer_reads_none() {
        let timer = TimerFd::new().unwrap();
        assert_eq!(timer.read().unwrap(), None);
    }

    #[test]
    fn one_shot_expires_once() {
        let timer = TimerFd::new().unwrap();
        timer.arm(Duration::from_millis(1), None).unwrap();
        sleep(Duration::from_millis(20));

        assert_eq!(timer.read().unwrap(), Some(1));
        assert_eq!(timer.read().unwrap(), None);
    }

    #[test]
    fn periodic_timer_accumulates_expirations() {
        let timer = TimerFd::new().unwrap();
        timer
            .arm(Duration::from_millis(2), Some(Duration::from_millis(2)))
            .unwrap();
        sleep(Duration::from_millis(30));

        let count = timer.read().unwrap().unwrap();
        assert!(count >= 2, "expected several expirations, got {count}");
        timer.disarm().unwrap();
    }

    #[test]
    fn clones_share_the_kernel_timer() {
        let timer = TimerFd::new().unwrap();
        let clone = timer.try_clone().unwrap();
        timer.arm(Duration::from_millis(1), None).unwrap();
        sleep(Duration::from_millis(20));

        assert_eq!(clone.read().unwrap(), Some(1));
        assert_eq!(timer.read().unwrap(), None);
    }
}
