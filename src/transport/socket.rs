use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::Debug,
    io::{Error, ErrorKind, IoSlice, Result},
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    rc::{Rc, Weak},
    time::Duration,
};

use crate::reactor::{EventBase, Interest, IoHandler, Readiness, TimeoutCallback, TimeoutKey};

use super::{sys, AsyncTransport, ConnectCallback, ReadCallback, WriteCallback};

/// Upper bound of a single `recv` regardless of what the read callback offers.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Lifecycle of an [`AsyncSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Established,
    /// Closed locally.
    Closed,
    /// Closed after an io error or timeout.
    Error,
}

struct PendingWrite {
    callback: Rc<dyn WriteCallback>,
    data: Vec<u8>,
    written: usize,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Connect,
    Send,
}

struct SocketTimer {
    socket: Weak<AsyncSocket>,
    kind: TimerKind,
}

impl TimeoutCallback for SocketTimer {
    fn timeout_expired(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.timer_expired(self.kind);
        }
    }
}

/// Non-blocking tcp socket driven by an [`EventBase`], reporting progress
/// through [`ConnectCallback`], [`ReadCallback`] and [`WriteCallback`] objects.
pub struct AsyncSocket {
    evb: EventBase,
    this: Weak<AsyncSocket>,
    fd: RefCell<Option<OwnedFd>>,
    state: Cell<SocketState>,
    interest: Cell<Interest>,
    connect_callback: RefCell<Option<Rc<dyn ConnectCallback>>>,
    connect_timer: Cell<Option<TimeoutKey>>,
    read_callback: RefCell<Option<Rc<dyn ReadCallback>>>,
    read_eof: Cell<bool>,
    writes: RefCell<VecDeque<PendingWrite>>,
    write_shutdown: Cell<bool>,
    shutdown_pending: Cell<bool>,
    close_pending: Cell<bool>,
    send_timeout: Cell<Duration>,
    send_timer: Cell<Option<TimeoutKey>>,
}

impl Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("fd", &self.raw_fd())
            .field("state", &self.state.get())
            .finish()
    }
}

impl AsyncSocket {
    /// Create an unconnected socket bound to `evb`.
    pub fn new(evb: &EventBase) -> Rc<Self> {
        Self::build(evb, None, SocketState::Unconnected)
    }

    /// Wrap an already connected stream socket.
    pub fn from_fd(evb: &EventBase, fd: OwnedFd) -> Result<Rc<Self>> {
        sys::set_nonblocking(fd.as_raw_fd())?;

        Ok(Self::build(evb, Some(fd), SocketState::Established))
    }

    fn build(evb: &EventBase, fd: Option<OwnedFd>, state: SocketState) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            evb: evb.clone(),
            this: this.clone(),
            fd: RefCell::new(fd),
            state: Cell::new(state),
            interest: Cell::new(Interest::NONE),
            connect_callback: Default::default(),
            connect_timer: Default::default(),
            read_callback: Default::default(),
            read_eof: Default::default(),
            writes: Default::default(),
            write_shutdown: Default::default(),
            shutdown_pending: Default::default(),
            close_pending: Default::default(),
            send_timeout: Default::default(),
            send_timer: Default::default(),
        })
    }

    pub fn event_base(&self) -> &EventBase {
        &self.evb
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.borrow().as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Number of writes not yet fully handed to the kernel.
    pub fn pending_writes(&self) -> usize {
        self.writes.borrow().len()
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        let fd = self.raw_fd().ok_or_else(|| not_open("socket is not open"))?;

        sys::set_send_buffer_size(fd, size)
    }

    fn desired_interest(&self) -> Interest {
        match self.state.get() {
            SocketState::Connecting => Interest::WRITABLE,
            SocketState::Established => Interest {
                readable: self.read_callback.borrow().is_some(),
                writable: !self.writes.borrow().is_empty(),
            },
            _ => Interest::NONE,
        }
    }

    fn update_interest(&self) {
        let Some(fd) = self.raw_fd() else {
            return;
        };

        let prev = self.interest.get();
        let next = self.desired_interest();

        if prev == next {
            return;
        }

        let handler: Weak<dyn IoHandler> = self.this.clone();

        match self.evb.update_interest(fd, prev, next, handler) {
            Ok(()) => self.interest.set(next),
            Err(err) => {
                log::debug!("socket({}) update interest failed, {}", fd, err);
                self.fail(err);
            }
        }
    }

    fn schedule_timer(&self, kind: TimerKind, timeout: Duration) -> TimeoutKey {
        self.evb.schedule_timeout(
            Rc::new(SocketTimer {
                socket: self.this.clone(),
                kind,
            }),
            timeout,
        )
    }

    fn cancel_timer(&self, timer: &Cell<Option<TimeoutKey>>) {
        if let Some(key) = timer.take() {
            self.evb.cancel_timeout(key);
        }
    }

    fn timer_expired(&self, kind: TimerKind) {
        match kind {
            TimerKind::Connect => {
                self.connect_timer.set(None);

                if self.state.get() == SocketState::Connecting {
                    self.fail(Error::new(ErrorKind::TimedOut, "connect timed out"));
                }
            }
            TimerKind::Send => {
                self.send_timer.set(None);

                if !self.writes.borrow().is_empty() {
                    self.fail(Error::new(ErrorKind::TimedOut, "write timed out"));
                }
            }
        }
    }

    fn close_now(&self) {
        self.teardown(SocketState::Closed, None);
    }

    fn fail(&self, err: Error) {
        log::debug!("socket({:?}) failed, {}", self.raw_fd(), err);

        self.teardown(SocketState::Error, Some(err));
    }

    /// Release the fd and notify every installed callback. `err` of `None`
    /// means a local close: readers see EOF, writers `NotConnected`.
    fn teardown(&self, state: SocketState, err: Option<Error>) {
        let was = self.state.replace(state);

        if was == SocketState::Closed || was == SocketState::Error {
            self.state.set(was);
            return;
        }

        self.cancel_timer(&self.connect_timer);
        self.cancel_timer(&self.send_timer);

        let fd = self.fd.borrow_mut().take();

        if let Some(fd) = fd {
            log::debug!("close tcp socket({})", fd.as_raw_fd());

            self.evb.forget(fd.as_raw_fd());
            self.interest.set(Interest::NONE);
        }

        let connect = self.connect_callback.borrow_mut().take();
        let read = self.read_callback.borrow_mut().take();
        let writes = std::mem::take(&mut *self.writes.borrow_mut());

        let failed = err.is_some();
        let described = err.as_ref().map(|err| (err.kind(), err.to_string()));

        // the first callback gets the original error, the rest a copy
        let mut original = err;
        let mut error = || match (original.take(), &described) {
            (Some(err), _) => err,
            (None, Some((kind, message))) => Error::new(*kind, message.clone()),
            (None, None) => not_open("socket closed locally"),
        };

        if let Some(callback) = connect {
            callback.connect_err(error());
        }

        if let Some(callback) = read {
            if failed {
                callback.read_err(error());
            } else {
                callback.read_eof();
            }
        }

        for write in writes {
            write.callback.write_err(write.written, error());
        }
    }

    fn connect_succeeded(&self) {
        self.state.set(SocketState::Established);
        self.cancel_timer(&self.connect_timer);

        // a failure here notifies the still installed connect callback
        self.update_interest();

        if self.state.get() != SocketState::Established {
            return;
        }

        let callback = self.connect_callback.borrow_mut().take();

        log::trace!("socket({:?}) connected", self.raw_fd());

        if let Some(callback) = callback {
            callback.connect_success();
        }
    }

    fn finish_connect(&self) {
        let Some(fd) = self.raw_fd() else {
            return;
        };

        match sys::take_error(fd) {
            Ok(None) => self.connect_succeeded(),
            Ok(Some(err)) | Err(err) => self.fail(err),
        }
    }

    fn handle_read(&self) {
        let Some(fd) = self.raw_fd() else {
            return;
        };

        for _ in 0..self.evb.config().max_reads_per_event {
            let callback = self.read_callback.borrow().clone();

            let Some(callback) = callback else {
                break;
            };

            let len = callback.prepare_read_buffer().min(MAX_READ_CHUNK);

            if len == 0 {
                break;
            }

            let mut buff = vec![0u8; len];

            match sys::recv(fd, &mut buff) {
                Ok(0) => {
                    log::trace!("socket({}) read eof", fd);

                    self.read_eof.set(true);
                    self.read_callback.borrow_mut().take();
                    self.update_interest();

                    callback.read_eof();

                    break;
                }
                Ok(len) => callback.read_data_available(&buff[..len]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }

            // the callback may have closed the socket
            if self.raw_fd() != Some(fd) {
                break;
            }
        }
    }

    fn handle_write(&self) {
        let Some(fd) = self.raw_fd() else {
            return;
        };

        let mut progress = false;

        loop {
            let result = {
                let writes = self.writes.borrow();

                let Some(front) = writes.front() else {
                    break;
                };

                sys::send(fd, &front.data[front.written..])
            };

            match result {
                Ok(len) => {
                    progress = true;

                    let finished = {
                        let mut writes = self.writes.borrow_mut();

                        match writes.front_mut() {
                            Some(front) => {
                                front.written += len;

                                if front.written >= front.data.len() {
                                    writes.pop_front()
                                } else {
                                    None
                                }
                            }
                            None => None,
                        }
                    };

                    if let Some(finished) = finished {
                        log::trace!("socket({}) write of {} bytes done", fd, finished.written);

                        finished.callback.write_success();

                        if self.raw_fd() != Some(fd) {
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }

        self.rearm_send_timer(progress);

        if self.writes.borrow().is_empty() {
            if self.close_pending.get() {
                self.close_now();
                return;
            }

            if self.shutdown_pending.replace(false) {
                if let Err(err) = sys::shutdown_write(fd) {
                    log::debug!("socket({}) shutdown failed, {}", fd, err);
                }
            }
        }

        self.update_interest();
    }

    fn rearm_send_timer(&self, progress: bool) {
        let pending = !self.writes.borrow().is_empty();

        if progress || !pending {
            self.cancel_timer(&self.send_timer);
        }

        let timeout = self.send_timeout.get();

        if pending && !timeout.is_zero() && self.send_timer.get().is_none() {
            self.send_timer
                .set(Some(self.schedule_timer(TimerKind::Send, timeout)));
        }
    }
}

fn not_open(msg: &str) -> Error {
    Error::new(ErrorKind::NotConnected, msg.to_owned())
}

impl IoHandler for AsyncSocket {
    fn handle_ready(&self, readiness: Readiness) {
        match self.state.get() {
            SocketState::Connecting => self.finish_connect(),
            SocketState::Established => {
                if readiness.writable {
                    self.handle_write();
                }

                if readiness.readable && self.state.get() == SocketState::Established {
                    self.handle_read();
                }
            }
            _ => {}
        }
    }
}

impl AsyncTransport for AsyncSocket {
    fn connect(&self, callback: Rc<dyn ConnectCallback>, to: SocketAddr, timeout: Duration) {
        log::trace!("socket connect({}) timeout({:?})", to, timeout);

        if self.state.get() != SocketState::Unconnected {
            callback.connect_err(Error::new(
                ErrorKind::InvalidInput,
                "connect() called with socket in invalid state",
            ));
            return;
        }

        let fd = match sys::tcp_socket(&to) {
            Ok(fd) => fd,
            Err(err) => {
                self.state.set(SocketState::Error);
                callback.connect_err(err);
                return;
            }
        };

        let raw = fd.as_raw_fd();

        *self.fd.borrow_mut() = Some(fd);
        *self.connect_callback.borrow_mut() = Some(callback);

        match sys::connect(raw, &to) {
            Ok(true) => self.connect_succeeded(),
            Ok(false) => {
                self.state.set(SocketState::Connecting);

                if !timeout.is_zero() {
                    self.connect_timer
                        .set(Some(self.schedule_timer(TimerKind::Connect, timeout)));
                }

                self.update_interest();
            }
            Err(err) => self.fail(err),
        }
    }

    fn cancel_connect(&self) {
        let callback = self.connect_callback.borrow_mut().take();

        if self.state.get() == SocketState::Connecting {
            log::trace!("socket({:?}) connect cancelled", self.raw_fd());
            self.close_now();
        }

        drop(callback);
    }

    fn set_read_callback(&self, callback: Option<Rc<dyn ReadCallback>>) {
        let Some(callback) = callback else {
            let prev = self.read_callback.borrow_mut().take();

            if prev.is_some() {
                self.update_interest();
            }

            return;
        };

        match self.state.get() {
            SocketState::Unconnected | SocketState::Connecting => {
                *self.read_callback.borrow_mut() = Some(callback);
            }
            SocketState::Established => {
                if self.read_eof.get() {
                    callback.read_eof();
                    return;
                }

                *self.read_callback.borrow_mut() = Some(callback);
                self.update_interest();
            }
            SocketState::Closed | SocketState::Error => {
                callback.read_err(not_open("read callback installed on a closed socket"));
            }
        }
    }

    fn write(&self, callback: Rc<dyn WriteCallback>, buf: &[u8]) {
        self.writev(callback, &[IoSlice::new(buf)]);
    }

    fn writev(&self, callback: Rc<dyn WriteCallback>, bufs: &[IoSlice<'_>]) {
        if self.state.get() != SocketState::Established {
            callback.write_err(0, not_open("write on a socket that is not connected"));
            return;
        }

        if self.write_shutdown.get() {
            callback.write_err(
                0,
                Error::new(ErrorKind::BrokenPipe, "write after shutdown"),
            );
            return;
        }

        let mut data = Vec::with_capacity(bufs.iter().map(|b| b.len()).sum());

        for buf in bufs {
            data.extend_from_slice(buf);
        }

        if data.is_empty() {
            callback.write_success();
            return;
        }

        let idle = {
            let mut writes = self.writes.borrow_mut();

            writes.push_back(PendingWrite {
                callback,
                data,
                written: 0,
            });

            writes.len() == 1
        };

        // only the head of the queue may be sent directly
        if idle {
            self.handle_write();
        }
    }

    fn set_send_timeout(&self, timeout: Duration) {
        self.send_timeout.set(timeout);
        self.cancel_timer(&self.send_timer);
        self.rearm_send_timer(false);
    }

    fn schedule_timeout(
        &self,
        callback: Rc<dyn TimeoutCallback>,
        timeout: Duration,
    ) -> TimeoutKey {
        self.evb.schedule_timeout(callback, timeout)
    }

    fn cancel_timeout(&self, key: TimeoutKey) -> bool {
        self.evb.cancel_timeout(key)
    }

    fn local_address(&self) -> Result<SocketAddr> {
        sys::local_addr(self.raw_fd().ok_or_else(|| not_open("socket is not open"))?)
    }

    fn peer_address(&self) -> Result<SocketAddr> {
        sys::peer_addr(self.raw_fd().ok_or_else(|| not_open("socket is not open"))?)
    }

    fn shutdown_write(&self) {
        self.write_shutdown.set(true);

        let Some(fd) = self.raw_fd() else {
            return;
        };

        if self.state.get() != SocketState::Established {
            return;
        }

        if self.writes.borrow().is_empty() {
            if let Err(err) = sys::shutdown_write(fd) {
                log::debug!("socket({}) shutdown failed, {}", fd, err);
            }
        } else {
            self.shutdown_pending.set(true);
        }
    }

    fn close(&self) {
        if self.state.get() != SocketState::Established || self.writes.borrow().is_empty() {
            self.close_now();
            return;
        }

        // flush pending writes first, reading stops now
        self.close_pending.set(true);
        self.write_shutdown.set(true);

        let read = self.read_callback.borrow_mut().take();

        self.update_interest();

        if let Some(callback) = read {
            callback.read_eof();
        }
    }

    fn close_with_reset(&self) {
        if let Some(fd) = self.raw_fd() {
            if let Err(err) = sys::set_linger_zero(fd) {
                log::debug!("socket({}) set linger failed, {}", fd, err);
            }
        }

        self.close_now();
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        for key in [self.connect_timer.take(), self.send_timer.take()]
            .into_iter()
            .flatten()
        {
            self.evb.cancel_timeout(key);
        }

        if let Some(fd) = self.fd.get_mut().take() {
            log::debug!("close tcp socket({})", fd.as_raw_fd());
            self.evb.forget(fd.as_raw_fd());
        }
    }
}
