//! Callback-driven transport: the layer that performs socket io on the
//! reactor thread and reports progress through callback objects.
//!
//! A transport invokes every callback from [`EventBase`](crate::reactor::EventBase)
//! dispatch (or synchronously from the registering call) and never holds a
//! `RefCell` borrow while doing so, so callbacks may re-enter the transport,
//! e.g. to deregister themselves.

use std::{
    io::{IoSlice, Result},
    net::SocketAddr,
    os::fd::OwnedFd,
    rc::Rc,
    time::Duration,
};

use crate::reactor::{TimeoutCallback, TimeoutKey};

mod server;
mod socket;
pub(crate) mod sys;

pub use server::*;
pub use socket::*;

/// Connect completion capability set.
pub trait ConnectCallback {
    fn connect_success(&self);

    fn connect_err(&self, err: std::io::Error);
}

/// Read capability set. Installed with [`AsyncTransport::set_read_callback`]
/// and invoked until it is uninstalled, EOF or an error.
pub trait ReadCallback {
    /// Called right before [`read_data_available`](ReadCallback::read_data_available),
    /// always in the same sequence. Returns how many bytes the callback can
    /// accept; zero stops reading for this event.
    fn prepare_read_buffer(&self) -> usize;

    /// `data` is never longer than the last `prepare_read_buffer` result.
    fn read_data_available(&self, data: &[u8]);

    /// The peer closed its write side. The transport has already uninstalled
    /// the callback.
    fn read_eof(&self);

    /// The transport has already uninstalled the callback.
    fn read_err(&self, err: std::io::Error);
}

/// Write completion capability set. Exactly one of the methods is called per
/// registered write.
pub trait WriteCallback {
    fn write_success(&self);

    /// `bytes_written` bytes of this write reached the kernel before `err`.
    fn write_err(&self, bytes_written: usize, err: std::io::Error);
}

/// Accept capability set for listening sockets.
pub trait AcceptCallback {
    /// A new connection, already switched to non-blocking mode.
    fn connection_accepted(&self, conn: OwnedFd, remote: SocketAddr);

    fn accept_error(&self, err: std::io::Error);
}

/// Byte-stream transport as seen by the [`Socket`](crate::Socket) adapter.
///
/// All methods are called on the reactor thread. A zero `Duration` always
/// means "no timeout".
pub trait AsyncTransport: 'static {
    /// Start connecting to `to`. Completion goes to `callback`, which is
    /// dropped by the transport after it fired or after [`cancel_connect`](Self::cancel_connect).
    fn connect(&self, callback: Rc<dyn ConnectCallback>, to: SocketAddr, timeout: Duration);

    /// Abort an in-flight connect without notifying its callback.
    fn cancel_connect(&self);

    /// Install or (with `None`) uninstall the read callback. Uninstalling is
    /// idempotent.
    fn set_read_callback(&self, callback: Option<Rc<dyn ReadCallback>>);

    fn write(&self, callback: Rc<dyn WriteCallback>, buf: &[u8]);

    fn writev(&self, callback: Rc<dyn WriteCallback>, bufs: &[IoSlice<'_>]);

    /// Fail pending writes when no progress is made for `timeout`.
    fn set_send_timeout(&self, timeout: Duration);

    /// Timer facility of the reactor the transport runs on.
    fn schedule_timeout(&self, callback: Rc<dyn TimeoutCallback>, timeout: Duration)
        -> TimeoutKey;

    fn cancel_timeout(&self, key: TimeoutKey) -> bool;

    fn local_address(&self) -> Result<SocketAddr>;

    fn peer_address(&self) -> Result<SocketAddr>;

    /// Half-close once pending writes are flushed.
    fn shutdown_write(&self);

    /// Close once pending writes are flushed.
    fn close(&self);

    /// Close immediately, sending a reset to the peer. Pending writes fail.
    fn close_with_reset(&self);
}
