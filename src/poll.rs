//! The reactor's readiness loop: one epoll instance per reactor, woken
//! by an eventfd and ticked by a periodic timerfd.
//!
//! Tokens: connection sockets carry their fd as the epoll user data;
//! the two reserved tokens below mark the wakeup and tick sources.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token of the eventfd wakeup source.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;
/// Token of the coarse-tick timerfd.
pub(crate) const TICK_TOKEN: u64 = u64::MAX - 1;

/// A readiness event copied out of the kernel buffer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PollEvent {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// EPOLLERR.
    pub error: bool,
    /// EPOLLHUP / EPOLLRDHUP.
    pub hangup: bool,
}

struct WakeFd(RawFd);

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Cross-thread wake handle for a reactor's event loop.
///
/// Writing the eventfd is idempotent with respect to the next drain:
/// however many wakes land before the reactor reads, one read clears
/// them all.
#[derive(Clone)]
pub(crate) struct Waker {
    fd: Arc<WakeFd>,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker {
            fd: Arc::new(WakeFd(fd)),
        })
    }

    /// Wake the reactor. Safe from any thread; a failed write (reactor
    /// already gone) is ignored.
    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd.0, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    fn raw(&self) -> RawFd {
        self.fd.0
    }
}

/// epoll wrapper owned by the reactor thread.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    timer_fd: RawFd,
    waker: Waker,
    /// Kernel-filled event buffer, reused across polls.
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// Create the epoll instance, register the waker, and arm the
    /// periodic coarse tick.
    pub(crate) fn new(waker: Waker, tick_period: Duration) -> io::Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        let poller = Poller {
            epoll_fd,
            timer_fd,
            waker,
            events: Vec::with_capacity(256),
        };

        poller.arm_tick(tick_period)?;
        poller.ctl(libc::EPOLL_CTL_ADD, poller.waker.raw(), libc::EPOLLIN as u32, WAKE_TOKEN)?;
        poller.ctl(libc::EPOLL_CTL_ADD, timer_fd, libc::EPOLLIN as u32, TICK_TOKEN)?;

        Ok(poller)
    }

    fn arm_tick(&self, period: Duration) -> io::Result<()> {
        let timerspec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: period.as_secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            },
            it_value: libc::timespec {
                tv_sec: period.as_secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            },
        };
        let ret =
            unsafe { libc::timerfd_settime(self.timer_fd, 0, &timerspec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register a connection socket for read readiness. The fd doubles
    /// as the token.
    pub(crate) fn register(&self, fd: RawFd) -> io::Result<()> {
        let interest = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, fd as u64)
    }

    /// Add or remove write interest for a registered socket.
    pub(crate) fn set_write_interest(&self, fd: RawFd, writable: bool) -> io::Result<()> {
        let mut interest = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if writable {
            interest |= libc::EPOLLOUT as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, fd as u64)
    }

    /// Remove a socket from the epoll set. A failure is ignored; the fd
    /// may already be closed.
    pub(crate) fn deregister(&self, fd: RawFd) {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut ev);
        }
    }

    /// Wait for readiness, copying events into `out`. `timeout = None`
    /// blocks until an event arrives (the periodic tick bounds the wait).
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<PollEvent>,
    ) -> io::Result<()> {
        out.clear();

        let timeout_ms: libc::c_int = match timeout {
            // Round up so a deadline a few microseconds away does not
            // spin on zero-length waits.
            Some(t) => t.as_millis().saturating_add(1).min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        self.events.clear();
        let capacity = self.events.capacity() as libc::c_int;
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, self.events.as_mut_ptr(), capacity, timeout_ms)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        unsafe {
            self.events.set_len(n);
        }

        for ev in &self.events {
            let bits = ev.events;
            out.push(PollEvent {
                token: ev.u64,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error: bits & libc::EPOLLERR as u32 != 0,
                hangup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
            });
        }
        Ok(())
    }

    /// Clear the wakeup eventfd after a WAKE_TOKEN event.
    pub(crate) fn consume_wake(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.waker.raw(), buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    /// Clear the timerfd after a TICK_TOKEN event.
    pub(crate) fn consume_tick(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.timer_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
            libc::close(self.epoll_fd);
        }
        // The waker eventfd closes with its last clone; producers may
        // still hold one after the reactor thread exits.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_is_observed_and_collapses() {
        let waker = Waker::new().unwrap();
        let mut poller = Poller::new(waker.clone(), Duration::from_secs(60)).unwrap();
        waker.wake();
        waker.wake();
        waker.wake();

        let mut events = Vec::new();
        poller.poll(Some(Duration::from_millis(100)), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, WAKE_TOKEN);
        poller.consume_wake();

        // All three wakes collapsed into the one drained above.
        poller.poll(Some(Duration::from_millis(10)), &mut events).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn tick_fires_periodically() {
        let waker = Waker::new().unwrap();
        let mut poller = Poller::new(waker, Duration::from_millis(5)).unwrap();
        let mut events = Vec::new();
        poller.poll(Some(Duration::from_millis(500)), &mut events).unwrap();
        assert!(events.iter().any(|ev| ev.token == TICK_TOKEN));
    }
}
