use std::{
    io::{Error, ErrorKind, Result},
    os::fd::RawFd,
    time::Duration,
};

use libc::*;

use super::{Interest, Readiness};

/// Readiness multiplexer backed by epoll (level triggered).
#[derive(Debug)]
pub struct Poller {
    handle: RawFd,
}

impl Drop for Poller {
    fn drop(&mut self) {
        log::debug!("close epoll handle({})", self.handle);
        unsafe { close(self.handle) };
    }
}

impl Poller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { epoll_create1(EPOLL_CLOEXEC) };

        if -1 == handle {
            return Err(Error::last_os_error());
        }

        Ok(Self { handle })
    }

    /// Move `fd` from the `prev` registration to `next`.
    pub fn update(&self, fd: RawFd, prev: Interest, next: Interest) -> Result<()> {
        let op = match (prev.is_none(), next.is_none()) {
            (true, true) => return Ok(()),
            (true, false) => EPOLL_CTL_ADD,
            (false, true) => EPOLL_CTL_DEL,
            (false, false) => EPOLL_CTL_MOD,
        };

        let mut event = epoll_event {
            events: Self::events(next),
            u64: fd as u64,
        };

        let ret = unsafe { epoll_ctl(self.handle, op, fd, &mut event) };

        if ret == -1 {
            return Err(Error::last_os_error());
        }

        log::trace!("epoll_ctl fd({}) op({}) {:?}", fd, op, next);

        Ok(())
    }

    fn events(interest: Interest) -> u32 {
        let mut events = 0;

        if interest.readable {
            events |= EPOLLIN | EPOLLRDHUP;
        }

        if interest.writable {
            events |= EPOLLOUT;
        }

        events as u32
    }

    pub fn wait(
        &self,
        events: &mut Vec<(RawFd, Readiness)>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<()> {
        let mut fired: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; capacity.max(1)];

        let fired_len = unsafe {
            epoll_wait(
                self.handle,
                fired.as_mut_ptr(),
                fired.len() as c_int,
                timeout_ms(timeout),
            )
        };

        if fired_len < 0 {
            let err = Error::last_os_error();

            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }

            log::debug!("epoll_wait error({})", err);

            return Err(err);
        }

        for event in &fired[..fired_len as usize] {
            // epoll_event is packed on some targets, copy fields out
            let bits = event.events as c_int;
            let fd = event.u64 as RawFd;

            let failed = bits & (EPOLLERR | EPOLLHUP) != 0;

            events.push((
                fd,
                Readiness {
                    readable: failed || bits & (EPOLLIN | EPOLLRDHUP) != 0,
                    writable: failed || bits & EPOLLOUT != 0,
                },
            ));
        }

        Ok(())
    }
}

fn timeout_ms(timeout: Duration) -> c_int {
    let mut ms = timeout.as_millis();

    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }

    ms.min(c_int::MAX as u128) as c_int
}
