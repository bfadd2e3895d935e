use std::{
    io::{Error, ErrorKind, Result},
    os::fd::RawFd,
    ptr::{null, null_mut},
    time::Duration,
};

use libc::*;

use super::{Interest, Readiness};

/// Readiness multiplexer backed by kqueue.
#[derive(Debug)]
pub struct Poller {
    handle: RawFd,
}

impl Drop for Poller {
    fn drop(&mut self) {
        log::debug!("close kqueue handle({})", self.handle);
        unsafe { close(self.handle) };
    }
}

impl Poller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { kqueue() };

        if handle < 0 {
            return Err(Error::last_os_error());
        }

        unsafe { fcntl(handle, F_SETFD, FD_CLOEXEC) };

        Ok(Self { handle })
    }

    fn change(fd: RawFd, read: bool, add: bool) -> kevent {
        let mut event: kevent = unsafe { std::mem::zeroed() };

        event.ident = fd as _;
        event.filter = if read { EVFILT_READ } else { EVFILT_WRITE };
        event.flags = if add { EV_ADD } else { EV_DELETE };

        event
    }

    /// Move `fd` from the `prev` registration to `next`.
    pub fn update(&self, fd: RawFd, prev: Interest, next: Interest) -> Result<()> {
        let mut changes = Vec::with_capacity(2);

        if prev.readable != next.readable {
            changes.push(Self::change(fd, true, next.readable));
        }

        if prev.writable != next.writable {
            changes.push(Self::change(fd, false, next.writable));
        }

        if changes.is_empty() {
            return Ok(());
        }

        log::trace!("add to kevent fd({}) {:?}", fd, next);

        let ret = unsafe {
            kevent(
                self.handle,
                changes.as_ptr(),
                changes.len() as c_int,
                null_mut(),
                0,
                null(),
            )
        };

        if ret < 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    pub fn wait(
        &self,
        events: &mut Vec<(RawFd, Readiness)>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<()> {
        let mut fired: Vec<kevent> = vec![unsafe { std::mem::zeroed() }; capacity.max(1)];

        let timeout = timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        let fired_len = unsafe {
            kevent(
                self.handle,
                null(),
                0,
                fired.as_mut_ptr(),
                fired.len() as c_int,
                &timeout,
            )
        };

        if fired_len < 0 {
            let err = Error::last_os_error();

            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(err);
        }

        for event in &fired[..fired_len as usize] {
            let fd = event.ident as RawFd;

            if event.flags & EV_ERROR != 0 {
                log::error!(target:"kevent","fd({}) fired error,{}", fd, Error::from_raw_os_error(event.data as i32));

                events.push((
                    fd,
                    Readiness {
                        readable: true,
                        writable: true,
                    },
                ));

                continue;
            }

            match event.filter {
                EVFILT_READ => events.push((
                    fd,
                    Readiness {
                        readable: true,
                        writable: false,
                    },
                )),
                EVFILT_WRITE => events.push((
                    fd,
                    Readiness {
                        readable: false,
                        writable: true,
                    },
                )),
                _ => continue,
            }
        }

        Ok(())
    }
}
