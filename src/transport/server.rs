use std::{
    cell::{Cell, RefCell},
    fmt::Debug,
    io::{Error, ErrorKind, Result},
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    rc::{Rc, Weak},
};

use crate::reactor::{EventBase, Interest, IoHandler, Readiness};

use super::{sys, AcceptCallback};

/// Non-blocking listening socket. Accepted connections are handed to the
/// installed [`AcceptCallback`] as raw fds.
pub struct AsyncServerSocket {
    evb: EventBase,
    this: Weak<AsyncServerSocket>,
    fd: RefCell<Option<OwnedFd>>,
    interest: Cell<Interest>,
    callback: RefCell<Option<Rc<dyn AcceptCallback>>>,
    local: SocketAddr,
}

impl Debug for AsyncServerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncServerSocket")
            .field("fd", &self.raw_fd())
            .field("local", &self.local)
            .finish()
    }
}

impl AsyncServerSocket {
    /// Bind and listen on `addr`. Port 0 picks an ephemeral port, see
    /// [`local_address`](Self::local_address).
    pub fn bind(evb: &EventBase, addr: SocketAddr, backlog: u32) -> Result<Rc<Self>> {
        let fd = sys::tcp_listener(&addr, backlog)?;

        let local = sys::local_addr(fd.as_raw_fd())?;

        log::debug!("tcp listener({}) bound to {}", fd.as_raw_fd(), local);

        Ok(Rc::new_cyclic(|this| Self {
            evb: evb.clone(),
            this: this.clone(),
            fd: RefCell::new(Some(fd)),
            interest: Cell::new(Interest::NONE),
            callback: Default::default(),
            local,
        }))
    }

    pub fn event_base(&self) -> &EventBase {
        &self.evb
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.borrow().as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Install or (with `None`) uninstall the accept callback.
    pub fn set_accept_callback(&self, callback: Option<Rc<dyn AcceptCallback>>) {
        if self.raw_fd().is_none() {
            if let Some(callback) = callback {
                callback.accept_error(Error::new(
                    ErrorKind::NotConnected,
                    "accept callback installed on a closed listener",
                ));
            }

            return;
        }

        let prev = self.callback.replace(callback);

        drop(prev);

        self.update_interest();
    }

    /// Stop listening. An installed accept callback receives an error.
    pub fn close(&self) {
        let fd = self.fd.borrow_mut().take();

        if let Some(fd) = fd {
            log::debug!("close tcp listener({})", fd.as_raw_fd());

            self.evb.forget(fd.as_raw_fd());
            self.interest.set(Interest::NONE);
        }

        let callback = self.callback.borrow_mut().take();

        if let Some(callback) = callback {
            callback.accept_error(Error::new(ErrorKind::NotConnected, "listener closed"));
        }
    }

    fn update_interest(&self) {
        let Some(fd) = self.raw_fd() else {
            return;
        };

        let prev = self.interest.get();

        let next = if self.callback.borrow().is_some() {
            Interest::READABLE
        } else {
            Interest::NONE
        };

        if prev == next {
            return;
        }

        let handler: Weak<dyn IoHandler> = self.this.clone();

        match self.evb.update_interest(fd, prev, next, handler) {
            Ok(()) => self.interest.set(next),
            Err(err) => {
                let callback = self.callback.borrow_mut().take();

                if let Some(callback) = callback {
                    callback.accept_error(err);
                }
            }
        }
    }
}

impl IoHandler for AsyncServerSocket {
    fn handle_ready(&self, readiness: Readiness) {
        if !readiness.readable {
            return;
        }

        for _ in 0..self.evb.config().max_reads_per_event {
            let Some(fd) = self.raw_fd() else {
                break;
            };

            let callback = self.callback.borrow().clone();

            let Some(callback) = callback else {
                break;
            };

            match sys::accept(fd) {
                Ok((conn, remote)) => callback.connection_accepted(conn, remote),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("tcp listener({}) accept failed, {}", fd, err);
                    callback.accept_error(err);
                    break;
                }
            }
        }
    }
}

impl Drop for AsyncServerSocket {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.get_mut().take() {
            log::debug!("close tcp listener({})", fd.as_raw_fd());
            self.evb.forget(fd.as_raw_fd());
        }
    }
}
