//! Suspend/resume socket adapter.
//!
//! Every operation issues exactly one transport call, suspends until the
//! transport reports completion (or the current cancellation token fires)
//! and turns the recorded outcome into a [`Result`].

mod completion;
mod server;

#[cfg(test)]
mod tests;

use std::{
    io::{self, IoSlice},
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use bytes::BytesMut;

use crate::{
    reactor::EventBase,
    transport::{AsyncSocket, AsyncTransport, WriteCallback},
    Result,
};

use completion::{
    complete, Completion, ConnectCompletion, ReadCompletion, ReadTarget, WriteCompletion,
};

pub use server::*;

/// Filled in with the number of bytes that reached the transport when a
/// write fails or is cancelled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteInfo {
    pub bytes_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Idle,
    /// The last read returned data and saw the end of the stream in the same
    /// event. The next read reports EOF without touching the transport.
    EofPending,
}

/// Socket whose operations are `async fn`s driven by a callback based
/// [`AsyncTransport`].
///
/// All operations take `&mut self`, so at most one operation is in flight
/// per socket.
#[derive(Debug)]
pub struct Socket<T: AsyncTransport = AsyncSocket> {
    transport: Rc<T>,
    read_state: ReadState,
}

impl Socket<AsyncSocket> {
    /// Connect a new tcp socket running on `evb`. A zero `timeout` disables
    /// the connect timeout.
    pub async fn connect(evb: &EventBase, addr: SocketAddr, timeout: Duration) -> Result<Self> {
        Self::connect_with(AsyncSocket::new(evb), addr, timeout).await
    }

    pub fn event_base(&self) -> &EventBase {
        self.transport.event_base()
    }
}

impl<T: AsyncTransport> Socket<T> {
    /// Wrap an already connected transport.
    pub fn new(transport: Rc<T>) -> Self {
        Self {
            transport,
            read_state: ReadState::Idle,
        }
    }

    /// Connect `transport` to `addr`. No socket is returned unless the
    /// connect succeeded.
    pub async fn connect_with(
        transport: Rc<T>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        let completion = Rc::new(ConnectCompletion::new(transport.clone()));

        let resumed = complete(&completion, || {
            transport.connect(completion.clone(), addr, timeout);
        })
        .await;

        resumed.resolve(|| completion.result()).into_result()?;

        log::trace!("connected to {}", addr);

        Ok(Self::new(transport))
    }

    pub fn transport(&self) -> &Rc<T> {
        &self.transport
    }

    pub fn local_address(&self) -> io::Result<SocketAddr> {
        self.transport.local_address()
    }

    pub fn peer_address(&self) -> io::Result<SocketAddr> {
        self.transport.peer_address()
    }

    /// Read into `buf`, returning the number of bytes read. `Ok(0)` means end
    /// of stream (or an empty `buf`). A zero `timeout` waits forever.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.take_deferred_eof() {
            return Ok(0);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let completion = Rc::new(ReadCompletion::new(
            self.transport.clone(),
            ReadTarget::fixed(buf.len()),
            timeout,
        ));

        let len = self.read_with(&completion).await?;

        completion.copy_staged(&mut buf[..len]);

        Ok(len)
    }

    /// Append to `buf`, growing it by at least `new_allocation_size` bytes
    /// whenever less than `min_read_size` bytes of spare capacity remain.
    /// Returns the number of bytes appended.
    pub async fn read_buf(
        &mut self,
        buf: &mut BytesMut,
        min_read_size: usize,
        new_allocation_size: usize,
        timeout: Duration,
    ) -> Result<usize> {
        if self.take_deferred_eof() {
            return Ok(0);
        }

        let completion = Rc::new(ReadCompletion::new(
            self.transport.clone(),
            ReadTarget::Growing {
                queue: std::mem::take(buf),
                min_read_size: min_read_size.max(1),
                new_allocation_size,
            },
            timeout,
        ));

        let restore = RestoreQueue {
            buf,
            completion: completion.clone(),
        };

        let result = self.read_with(&completion).await;

        drop(restore);

        result
    }

    fn take_deferred_eof(&mut self) -> bool {
        if self.read_state == ReadState::EofPending {
            log::trace!("reporting deferred eof");

            self.read_state = ReadState::Idle;

            return true;
        }

        false
    }

    async fn read_with(&mut self, completion: &Rc<ReadCompletion<T>>) -> Result<usize> {
        let resumed = complete(completion, || completion.issue()).await;

        if completion.signal().is_issued() {
            completion.deregister();
        }

        let (len, eof) = resumed.resolve(|| completion.result()).into_result()?;

        if eof && len > 0 {
            self.read_state = ReadState::EofPending;
        }

        Ok(len)
    }

    /// Write all of `buf`. On failure `write_info` (if any) receives the
    /// number of bytes written before the error.
    pub async fn write(
        &mut self,
        buf: &[u8],
        timeout: Duration,
        write_info: Option<&mut WriteInfo>,
    ) -> Result<()> {
        self.write_with(timeout, write_info, |transport, callback| {
            transport.write(callback, buf)
        })
        .await
    }

    /// Scatter/gather form of [`write`](Self::write), issued as one transport
    /// write.
    pub async fn write_vectored(
        &mut self,
        bufs: &[IoSlice<'_>],
        timeout: Duration,
        write_info: Option<&mut WriteInfo>,
    ) -> Result<()> {
        self.write_with(timeout, write_info, |transport, callback| {
            transport.writev(callback, bufs)
        })
        .await
    }

    async fn write_with<F>(
        &mut self,
        timeout: Duration,
        write_info: Option<&mut WriteInfo>,
        issue: F,
    ) -> Result<()>
    where
        F: FnOnce(&T, Rc<dyn WriteCallback>),
    {
        let completion = Rc::new(WriteCompletion::new(self.transport.clone()));

        let transport = &self.transport;

        let resumed = complete(&completion, || {
            let callback: Rc<dyn WriteCallback> = completion.clone();

            transport.set_send_timeout(timeout);
            issue(transport.as_ref(), callback);
        })
        .await;

        let result = resumed.resolve(|| completion.result()).into_result();

        if result.is_err() {
            if let Some(write_info) = write_info {
                write_info.bytes_written = completion.bytes_written();
            }
        }

        result
    }

    /// Close after pending writes are flushed.
    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn shutdown_write(&mut self) {
        self.transport.shutdown_write();
    }

    pub fn close_with_reset(&mut self) {
        self.transport.close_with_reset();
    }
}

/// Gives a growing read buffer back to the caller, including when the read
/// future is dropped mid-flight.
struct RestoreQueue<'a, T: AsyncTransport> {
    buf: &'a mut BytesMut,
    completion: Rc<ReadCompletion<T>>,
}

impl<'a, T: AsyncTransport> Drop for RestoreQueue<'a, T> {
    fn drop(&mut self) {
        *self.buf = self.completion.take_queue();
    }
}
