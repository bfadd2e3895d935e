//! Per-operation callback objects bridging transport callbacks to a [`Baton`].
//!
//! Each object is created right before its operation is issued, registered
//! with the transport, and released after the awaiting adapter call resumed
//! and unregistered it.

use std::{
    cell::{Cell, RefCell},
    io,
    net::SocketAddr,
    os::fd::OwnedFd,
    rc::Rc,
    time::Duration,
};

use bytes::BytesMut;

use crate::{
    coro::{current_cancellation_token, Baton},
    reactor::{TimeoutCallback, TimeoutKey},
    transport::{
        AcceptCallback, AsyncServerSocket, AsyncTransport, ConnectCallback, ReadCallback,
        WriteCallback,
    },
    Error, Result,
};

/// Completion state shared by all variants.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    baton: Baton,
    issued: Cell<bool>,
    cancelled: Cell<bool>,
}

impl Signal {
    pub(crate) fn post(&self) {
        self.baton.post();
    }

    pub(crate) fn is_issued(&self) -> bool {
        self.issued.get()
    }
}

pub(crate) trait Completion: 'static {
    fn signal(&self) -> &Signal;

    /// Transport specific abort of the issued operation.
    fn abort(&self);

    /// Drop what the transport still holds for an operation that already
    /// signaled. Unlike [`abort`](Self::abort) this never disturbs the
    /// connection.
    fn release(&self) {}

    /// Runs at most once. Before the operation was issued there is nothing
    /// to abort and the transport is left untouched.
    fn cancel(&self) {
        let signal = self.signal();

        if signal.cancelled.replace(true) {
            return;
        }

        if signal.issued.get() {
            self.abort();
        }
    }
}

/// Recorded result of one operation. Cancellation takes priority over
/// whatever the transport reported.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Success(T),
    Failure(Error),
    Cancelled,
}

impl<T> Outcome<T> {
    pub(crate) fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumed {
    Signaled,
    Cancelled,
}

impl Resumed {
    pub(crate) fn resolve<T, F>(self, recorded: F) -> Outcome<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self {
            Resumed::Cancelled => Outcome::Cancelled,
            Resumed::Signaled => match recorded() {
                Ok(value) => Outcome::Success(value),
                Err(err) => Outcome::Failure(err),
            },
        }
    }
}

struct InFlight<C: Completion> {
    completion: Option<Rc<C>>,
}

impl<C: Completion> InFlight<C> {
    fn disarm(&mut self) {
        self.completion.take();
    }
}

impl<C: Completion> Drop for InFlight<C> {
    fn drop(&mut self) {
        // the awaiting future was dropped before the operation finished
        if let Some(completion) = self.completion.take() {
            if completion.signal().baton.is_posted() {
                log::trace!("operation dropped after completion");
                completion.release();
            } else {
                log::trace!("operation dropped in flight");
                completion.cancel();
            }
        }
    }
}

/// Issue one operation and suspend until it signals or the current
/// cancellation token fires.
pub(crate) async fn complete<C, F>(completion: &Rc<C>, issue: F) -> Resumed
where
    C: Completion,
    F: FnOnce(),
{
    let token = current_cancellation_token();

    if token.is_cancellation_requested() {
        completion.cancel();
        return Resumed::Cancelled;
    }

    let mut in_flight = InFlight {
        completion: Some(completion.clone()),
    };

    completion.signal().issued.set(true);

    issue();

    let observer = {
        let completion = completion.clone();

        token.on_cancel(move || {
            if !completion.signal().baton.is_posted() {
                completion.cancel();
            }

            completion.signal().post();
        })
    };

    completion.signal().baton.wait().await;

    in_flight.disarm();

    drop(observer);

    if token.is_cancellation_requested() {
        Resumed::Cancelled
    } else {
        Resumed::Signaled
    }
}

pub(crate) struct ConnectCompletion<T: AsyncTransport> {
    signal: Signal,
    transport: Rc<T>,
    error: RefCell<Option<io::Error>>,
}

impl<T: AsyncTransport> ConnectCompletion<T> {
    pub(crate) fn new(transport: Rc<T>) -> Self {
        Self {
            signal: Default::default(),
            transport,
            error: Default::default(),
        }
    }

    pub(crate) fn result(&self) -> Result<()> {
        match self.error.borrow_mut().take() {
            Some(err) => Err(Error::ConnectFailed(err)),
            None => Ok(()),
        }
    }
}

impl<T: AsyncTransport> Completion for ConnectCompletion<T> {
    fn signal(&self) -> &Signal {
        &self.signal
    }

    fn abort(&self) {
        self.transport.cancel_connect();
    }
}

impl<T: AsyncTransport> ConnectCallback for ConnectCompletion<T> {
    fn connect_success(&self) {
        self.signal.post();
    }

    fn connect_err(&self, err: io::Error) {
        log::trace!("connect error, {}", err);

        *self.error.borrow_mut() = Some(err);
        self.signal.post();
    }
}

/// Destination of a read.
#[derive(Debug)]
pub(crate) enum ReadTarget {
    /// Caller supplied buffer of `capacity` bytes. Data is staged here and
    /// copied out once the read resumes successfully.
    Fixed { staged: Vec<u8>, capacity: usize },
    /// Caller's growable buffer, appended to in place.
    Growing {
        queue: BytesMut,
        min_read_size: usize,
        new_allocation_size: usize,
    },
}

impl ReadTarget {
    pub(crate) fn fixed(capacity: usize) -> Self {
        ReadTarget::Fixed {
            staged: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

/// Read completion. Posts on the first batch of data, on EOF, on error and
/// on a timeout that found nothing read.
///
/// The "nothing read yet" test in [`timeout_expired`](TimeoutCallback::timeout_expired)
/// relies on the transport and timer callbacks running on the same reactor
/// thread: data and expiry can never interleave mid-callback.
pub(crate) struct ReadCompletion<T: AsyncTransport> {
    signal: Signal,
    transport: Rc<T>,
    target: RefCell<ReadTarget>,
    timeout: Duration,
    timer: Cell<Option<TimeoutKey>>,
    length: Cell<usize>,
    eof: Cell<bool>,
    error: RefCell<Option<Error>>,
}

impl<T: AsyncTransport> ReadCompletion<T> {
    pub(crate) fn new(transport: Rc<T>, target: ReadTarget, timeout: Duration) -> Self {
        Self {
            signal: Default::default(),
            transport,
            target: RefCell::new(target),
            timeout,
            timer: Default::default(),
            length: Default::default(),
            eof: Default::default(),
            error: Default::default(),
        }
    }

    /// Arm the timer (if any) and install the read callback.
    pub(crate) fn issue(self: &Rc<Self>) {
        if !self.timeout.is_zero() {
            let callback: Rc<dyn TimeoutCallback> = self.clone();

            self.timer
                .set(Some(self.transport.schedule_timeout(callback, self.timeout)));
        }

        let callback: Rc<dyn ReadCallback> = self.clone();

        self.transport.set_read_callback(Some(callback));
    }

    /// Uninstall the read callback and cancel the timer. Idempotent.
    pub(crate) fn deregister(&self) {
        self.transport.set_read_callback(None);

        if let Some(key) = self.timer.take() {
            self.transport.cancel_timeout(key);
        }
    }

    /// `(bytes_read, end_of_stream)`.
    pub(crate) fn result(&self) -> Result<(usize, bool)> {
        match self.error.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok((self.length.get(), self.eof.get())),
        }
    }

    /// Copy staged bytes of a fixed read into `buf`.
    pub(crate) fn copy_staged(&self, buf: &mut [u8]) -> usize {
        match &*self.target.borrow() {
            ReadTarget::Fixed { staged, .. } => {
                let len = staged.len().min(buf.len());

                buf[..len].copy_from_slice(&staged[..len]);

                len
            }
            ReadTarget::Growing { .. } => 0,
        }
    }

    /// Hand the growing buffer back.
    pub(crate) fn take_queue(&self) -> BytesMut {
        match &mut *self.target.borrow_mut() {
            ReadTarget::Growing { queue, .. } => std::mem::take(queue),
            ReadTarget::Fixed { .. } => BytesMut::new(),
        }
    }
}

impl<T: AsyncTransport> Completion for ReadCompletion<T> {
    fn signal(&self) -> &Signal {
        &self.signal
    }

    fn abort(&self) {
        self.deregister();
    }

    fn release(&self) {
        self.deregister();
    }
}

impl<T: AsyncTransport> ReadCallback for ReadCompletion<T> {
    fn prepare_read_buffer(&self) -> usize {
        match &mut *self.target.borrow_mut() {
            ReadTarget::Fixed { capacity, .. } => capacity.saturating_sub(self.length.get()),
            ReadTarget::Growing {
                queue,
                min_read_size,
                new_allocation_size,
            } => {
                if queue.capacity() - queue.len() < *min_read_size {
                    queue.reserve((*new_allocation_size).max(*min_read_size));
                }

                queue.capacity() - queue.len()
            }
        }
    }

    fn read_data_available(&self, data: &[u8]) {
        let full = match &mut *self.target.borrow_mut() {
            ReadTarget::Fixed { staged, capacity } => {
                staged.extend_from_slice(data);
                staged.len() >= *capacity
            }
            ReadTarget::Growing { queue, .. } => {
                queue.extend_from_slice(data);
                false
            }
        };

        self.length.set(self.length.get() + data.len());

        log::trace!("read {} bytes, {} total", data.len(), self.length.get());

        if full {
            self.deregister();
        }

        self.signal.post();
    }

    fn read_eof(&self) {
        self.eof.set(true);
        self.deregister();
        self.signal.post();
    }

    fn read_err(&self, err: io::Error) {
        log::trace!("read error, {}", err);

        *self.error.borrow_mut() = Some(Error::ReadFailed(err));
        self.deregister();
        self.signal.post();
    }
}

impl<T: AsyncTransport> TimeoutCallback for ReadCompletion<T> {
    fn timeout_expired(&self) {
        self.timer.set(None);
        self.transport.set_read_callback(None);

        if self.length.get() == 0 {
            log::trace!("read timed out after {:?}", self.timeout);

            *self.error.borrow_mut() = Some(Error::ReadTimedOut);
            self.signal.post();
        }
    }
}

pub(crate) struct WriteCompletion<T: AsyncTransport> {
    signal: Signal,
    transport: Rc<T>,
    bytes_written: Cell<usize>,
    error: RefCell<Option<io::Error>>,
}

impl<T: AsyncTransport> WriteCompletion<T> {
    pub(crate) fn new(transport: Rc<T>) -> Self {
        Self {
            signal: Default::default(),
            transport,
            bytes_written: Default::default(),
            error: Default::default(),
        }
    }

    pub(crate) fn bytes_written(&self) -> usize {
        self.bytes_written.get()
    }

    pub(crate) fn result(&self) -> Result<()> {
        match self.error.borrow_mut().take() {
            Some(source) => Err(Error::WriteFailed {
                bytes_written: self.bytes_written.get(),
                source,
            }),
            None => Ok(()),
        }
    }
}

impl<T: AsyncTransport> Completion for WriteCompletion<T> {
    fn signal(&self) -> &Signal {
        &self.signal
    }

    /// There is no way to take back queued bytes, so the connection goes.
    fn abort(&self) {
        self.transport.close_with_reset();
    }
}

impl<T: AsyncTransport> WriteCallback for WriteCompletion<T> {
    fn write_success(&self) {
        self.signal.post();
    }

    fn write_err(&self, bytes_written: usize, err: io::Error) {
        log::trace!("write error after {} bytes, {}", bytes_written, err);

        self.bytes_written.set(bytes_written);
        *self.error.borrow_mut() = Some(err);
        self.signal.post();
    }
}

pub(crate) struct AcceptCompletion {
    signal: Signal,
    server: Rc<AsyncServerSocket>,
    accepted: RefCell<Option<io::Result<(OwnedFd, SocketAddr)>>>,
}

impl AcceptCompletion {
    pub(crate) fn new(server: Rc<AsyncServerSocket>) -> Self {
        Self {
            signal: Default::default(),
            server,
            accepted: Default::default(),
        }
    }

    pub(crate) fn result(&self) -> Result<(OwnedFd, SocketAddr)> {
        match self.accepted.borrow_mut().take() {
            Some(Ok(accepted)) => Ok(accepted),
            Some(Err(err)) => Err(Error::AcceptFailed(err)),
            None => Err(Error::AcceptFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                "no connection accepted",
            ))),
        }
    }

    fn record(&self, accepted: io::Result<(OwnedFd, SocketAddr)>) {
        self.server.set_accept_callback(None);

        let duplicate = {
            let mut slot = self.accepted.borrow_mut();

            if slot.is_none() {
                *slot = Some(accepted);
                None
            } else {
                Some(accepted)
            }
        };

        if duplicate.is_some() {
            log::warn!("accept completion already resolved, dropping late result");
        }

        self.signal.post();
    }
}

impl Completion for AcceptCompletion {
    fn signal(&self) -> &Signal {
        &self.signal
    }

    fn abort(&self) {
        self.server.set_accept_callback(None);
    }

    fn release(&self) {
        self.server.set_accept_callback(None);
    }
}

impl AcceptCallback for AcceptCompletion {
    fn connection_accepted(&self, conn: OwnedFd, remote: SocketAddr) {
        self.record(Ok((conn, remote)));
    }

    fn accept_error(&self, err: io::Error) {
        self.record(Err(err));
    }
}
