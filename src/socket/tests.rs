use std::{
    cell::RefCell,
    future::Future,
    io::{self, ErrorKind, IoSlice},
    net::SocketAddr,
    rc::Rc,
    task::Poll,
    time::Duration,
};

use bytes::BytesMut;
use futures::FutureExt;
use futures_test::task::noop_context;
use slab::Slab;

use crate::{
    coro::{with_cancellation, CancellationSource},
    reactor::{TimeoutCallback, TimeoutKey},
    transport::{AsyncTransport, ConnectCallback, ReadCallback, WriteCallback},
    Error,
};

use super::{Socket, WriteInfo};

/// Scripted transport: records every call and lets the test play the
/// reactor's part.
#[derive(Default)]
struct MockTransport {
    calls: RefCell<Vec<&'static str>>,
    connect_callback: RefCell<Option<Rc<dyn ConnectCallback>>>,
    read_callback: RefCell<Option<Rc<dyn ReadCallback>>>,
    write_callback: RefCell<Option<Rc<dyn WriteCallback>>>,
    written: RefCell<Vec<u8>>,
    timers: RefCell<Slab<Rc<dyn TimeoutCallback>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.calls.borrow())
            .finish()
    }
}

impl MockTransport {
    fn record(&self, call: &'static str) {
        self.calls.borrow_mut().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls.borrow().iter().filter(|c| **c == call).count()
    }

    fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn finish_connect(&self, result: io::Result<()>) {
        let callback = self.connect_callback.borrow_mut().take().unwrap();

        match result {
            Ok(()) => callback.connect_success(),
            Err(err) => callback.connect_err(err),
        }
    }

    /// Deliver `data` the way a transport does: one `prepare_read_buffer`
    /// per chunk, as long as the callback stays installed.
    fn deliver(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let callback = self.read_callback.borrow().clone();

            let Some(callback) = callback else {
                break;
            };

            let len = callback.prepare_read_buffer().min(data.len());

            if len == 0 {
                break;
            }

            callback.read_data_available(&data[..len]);

            data = &data[len..];
        }
    }

    fn deliver_eof(&self) {
        let callback = self.read_callback.borrow_mut().take();

        if let Some(callback) = callback {
            callback.read_eof();
        }
    }

    fn deliver_err(&self, err: io::Error) {
        let callback = self.read_callback.borrow_mut().take();

        if let Some(callback) = callback {
            callback.read_err(err);
        }
    }

    fn finish_write(&self, result: Result<(), (usize, io::Error)>) {
        let callback = self.write_callback.borrow_mut().take().unwrap();

        match result {
            Ok(()) => callback.write_success(),
            Err((bytes_written, err)) => callback.write_err(bytes_written, err),
        }
    }

    fn fire_timers(&self) {
        let timers = std::mem::take(&mut *self.timers.borrow_mut());

        for (_, timer) in timers {
            timer.timeout_expired();
        }
    }

    fn has_read_callback(&self) -> bool {
        self.read_callback.borrow().is_some()
    }

    fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }
}

impl AsyncTransport for MockTransport {
    fn connect(&self, callback: Rc<dyn ConnectCallback>, _to: SocketAddr, _timeout: Duration) {
        self.record("connect");
        *self.connect_callback.borrow_mut() = Some(callback);
    }

    fn cancel_connect(&self) {
        self.record("cancel_connect");
        self.connect_callback.borrow_mut().take();
    }

    fn set_read_callback(&self, callback: Option<Rc<dyn ReadCallback>>) {
        match callback {
            Some(callback) => {
                self.record("set_read_callback");
                *self.read_callback.borrow_mut() = Some(callback);
            }
            None => {
                self.record("clear_read_callback");
                self.read_callback.borrow_mut().take();
            }
        }
    }

    fn write(&self, callback: Rc<dyn WriteCallback>, buf: &[u8]) {
        self.record("write");
        self.written.borrow_mut().extend_from_slice(buf);
        *self.write_callback.borrow_mut() = Some(callback);
    }

    fn writev(&self, callback: Rc<dyn WriteCallback>, bufs: &[IoSlice<'_>]) {
        self.record("writev");

        for buf in bufs {
            self.written.borrow_mut().extend_from_slice(buf);
        }

        *self.write_callback.borrow_mut() = Some(callback);
    }

    fn set_send_timeout(&self, _timeout: Duration) {
        self.record("set_send_timeout");
    }

    fn schedule_timeout(
        &self,
        callback: Rc<dyn TimeoutCallback>,
        _timeout: Duration,
    ) -> TimeoutKey {
        self.record("schedule_timeout");
        TimeoutKey(self.timers.borrow_mut().insert(callback) as u64)
    }

    fn cancel_timeout(&self, key: TimeoutKey) -> bool {
        self.record("cancel_timeout");

        let removed = self.timers.borrow_mut().try_remove(key.0 as usize);

        removed.is_some()
    }

    fn local_address(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:1812".parse().unwrap())
    }

    fn peer_address(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:1813".parse().unwrap())
    }

    fn shutdown_write(&self) {
        self.record("shutdown_write");
    }

    fn close(&self) {
        self.record("close");
    }

    fn close_with_reset(&self) {
        self.record("close_with_reset");

        let write = self.write_callback.borrow_mut().take();

        if let Some(write) = write {
            write.write_err(0, io::Error::new(ErrorKind::NotConnected, "reset"));
        }

        self.deliver_eof();
    }
}

fn poll_ready<F: Future + Unpin>(fut: &mut F) -> F::Output {
    match fut.poll_unpin(&mut noop_context()) {
        Poll::Ready(output) => output,
        Poll::Pending => panic!("future is pending"),
    }
}

fn connected() -> (Rc<MockTransport>, Socket<MockTransport>) {
    let transport = Rc::new(MockTransport::default());

    let socket = Socket::new(transport.clone());

    (transport, socket)
}

fn addr() -> SocketAddr {
    "127.0.0.1:1812".parse().unwrap()
}

#[test]
fn test_connect() {
    _ = pretty_env_logger::try_init();

    let transport = Rc::new(MockTransport::default());

    let mut connect = Socket::connect_with(transport.clone(), addr(), Duration::ZERO).boxed_local();

    assert!(connect.poll_unpin(&mut noop_context()).is_pending());

    transport.finish_connect(Ok(()));

    let socket = poll_ready(&mut connect).unwrap();

    assert_eq!(socket.peer_address().unwrap(), "127.0.0.1:1813".parse::<SocketAddr>().unwrap());
    assert_eq!(transport.calls(), ["connect"]);
}

#[test]
fn test_connect_timeout() {
    _ = pretty_env_logger::try_init();

    let transport = Rc::new(MockTransport::default());

    let mut connect =
        Socket::connect_with(transport.clone(), addr(), Duration::from_millis(50)).boxed_local();

    assert!(connect.poll_unpin(&mut noop_context()).is_pending());

    transport.finish_connect(Err(io::Error::new(ErrorKind::TimedOut, "connect timed out")));

    let err = poll_ready(&mut connect).unwrap_err();

    assert!(matches!(err, Error::ConnectFailed(_)));
    assert!(err.is_timeout());
}

#[test]
fn test_connect_cancelled_in_flight() {
    _ = pretty_env_logger::try_init();

    let transport = Rc::new(MockTransport::default());

    let source = CancellationSource::new();

    let mut connect = with_cancellation(
        source.token(),
        Socket::connect_with(transport.clone(), addr(), Duration::ZERO),
    );

    assert!(connect.poll_unpin(&mut noop_context()).is_pending());

    source.request_cancellation();

    assert!(poll_ready(&mut connect).unwrap_err().is_cancelled());

    assert_eq!(transport.count("cancel_connect"), 1);
}

#[test]
fn test_cancelled_before_issue() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let source = CancellationSource::new();

    source.request_cancellation();

    let err = poll_ready(&mut with_cancellation(
        source.token(),
        Socket::connect_with(transport.clone(), addr(), Duration::ZERO),
    ))
    .unwrap_err();

    assert!(err.is_cancelled());

    let mut buf = [0u8; 10];

    let err = poll_ready(&mut with_cancellation(
        source.token(),
        socket.read(&mut buf, Duration::from_secs(1)),
    ))
    .unwrap_err();

    assert!(err.is_cancelled());

    let mut info = WriteInfo { bytes_written: 7 };

    let err = poll_ready(&mut with_cancellation(
        source.token(),
        socket.write(b"hello", Duration::ZERO, Some(&mut info)),
    ))
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(info.bytes_written, 0);

    // nothing reached the transport
    assert!(transport.calls().is_empty());
}

#[test]
fn test_data_and_eof_in_one_event() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = [0u8; 10];

    {
        let mut read = socket.read(&mut buf, Duration::ZERO).boxed_local();

        assert!(read.poll_unpin(&mut noop_context()).is_pending());

        transport.deliver(b"abcd");
        transport.deliver_eof();

        assert_eq!(poll_ready(&mut read).unwrap(), 4);
    }

    assert_eq!(&buf[..4], b"abcd");

    transport.clear_calls();

    let len = poll_ready(&mut socket.read(&mut buf, Duration::ZERO).boxed_local()).unwrap();

    assert_eq!(len, 0);

    // the deferred eof is reported without the transport
    assert!(transport.calls().is_empty());
}

#[test]
fn test_eof_without_data() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = [0u8; 10];

    {
        let mut read = socket.read(&mut buf, Duration::ZERO).boxed_local();

        assert!(read.poll_unpin(&mut noop_context()).is_pending());

        transport.deliver_eof();

        assert_eq!(poll_ready(&mut read).unwrap(), 0);
    }

    transport.clear_calls();

    // no deferral: the next read goes to the transport again
    let mut read = socket.read(&mut buf, Duration::ZERO).boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    assert_eq!(transport.calls(), ["set_read_callback"]);
}

#[test]
fn test_full_buffer_deregisters() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = [0u8; 4];

    let mut read = socket.read(&mut buf, Duration::from_secs(1)).boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    assert_eq!(transport.pending_timers(), 1);

    transport.deliver(b"abcdef");

    // the callback went away once the buffer was full
    assert!(!transport.has_read_callback());
    assert_eq!(transport.pending_timers(), 0);

    assert_eq!(poll_ready(&mut read).unwrap(), 4);

    drop(read);

    assert_eq!(&buf, b"abcd");
}

#[test]
fn test_read_timeout() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = [0u8; 10];

    let mut read = socket.read(&mut buf, Duration::from_millis(50)).boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    transport.fire_timers();

    assert!(!transport.has_read_callback());

    assert!(matches!(poll_ready(&mut read), Err(Error::ReadTimedOut)));
}

#[test]
fn test_data_wins_over_timer() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = [0u8; 10];

    let mut read = socket.read(&mut buf, Duration::from_millis(50)).boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    transport.deliver(b"ab");

    // expiry in the same reactor pass, before the reader resumed
    transport.fire_timers();

    assert_eq!(poll_ready(&mut read).unwrap(), 2);
}

#[test]
fn test_read_error() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = [0u8; 10];

    let mut read = socket.read(&mut buf, Duration::from_millis(50)).boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    transport.deliver_err(io::Error::new(ErrorKind::ConnectionReset, "reset"));

    assert_eq!(transport.pending_timers(), 0);

    match poll_ready(&mut read) {
        Err(Error::ReadFailed(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_read_cancelled_in_flight() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let source = CancellationSource::new();

    let mut buf = [0u8; 10];

    let mut read = with_cancellation(source.token(), socket.read(&mut buf, Duration::from_secs(1)));

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    source.request_cancellation();

    assert!(!transport.has_read_callback());
    assert_eq!(transport.pending_timers(), 0);

    assert!(poll_ready(&mut read).unwrap_err().is_cancelled());
}

#[test]
fn test_read_dropped_in_flight() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = BytesMut::from(&b"head"[..]);

    let mut read = socket
        .read_buf(&mut buf, 16, 64, Duration::from_secs(1))
        .boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    drop(read);

    assert!(!transport.has_read_callback());
    assert_eq!(transport.pending_timers(), 0);

    // the caller gets its buffer back
    assert_eq!(&buf[..], b"head");
}

#[test]
fn test_growing_read() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = BytesMut::new();

    {
        let mut read = socket
            .read_buf(&mut buf, 4, 16, Duration::ZERO)
            .boxed_local();

        assert!(read.poll_unpin(&mut noop_context()).is_pending());

        transport.deliver(b"hello");

        assert_eq!(poll_ready(&mut read).unwrap(), 5);
    }

    assert!(!transport.has_read_callback());

    {
        let mut read = socket
            .read_buf(&mut buf, 4, 16, Duration::ZERO)
            .boxed_local();

        assert!(read.poll_unpin(&mut noop_context()).is_pending());

        transport.deliver(b" world");
        transport.deliver_eof();

        assert_eq!(poll_ready(&mut read).unwrap(), 6);
    }

    assert_eq!(&buf[..], b"hello world");

    let len = poll_ready(
        &mut socket
            .read_buf(&mut buf, 4, 16, Duration::ZERO)
            .boxed_local(),
    )
    .unwrap();

    assert_eq!(len, 0);
}

#[test]
fn test_empty_buffer_read() {
    let (transport, mut socket) = connected();

    let len = poll_ready(&mut socket.read(&mut [], Duration::ZERO).boxed_local()).unwrap();

    assert_eq!(len, 0);
    assert!(transport.calls().is_empty());
}

#[test]
fn test_write() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut write = socket
        .write(b"hello world", Duration::from_secs(1), None)
        .boxed_local();

    assert!(write.poll_unpin(&mut noop_context()).is_pending());

    transport.finish_write(Ok(()));

    poll_ready(&mut write).unwrap();

    assert_eq!(transport.calls(), ["set_send_timeout", "write"]);
    assert_eq!(&transport.written.borrow()[..], b"hello world");
}

#[test]
fn test_write_vectored() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let bufs = [IoSlice::new(b"hello "), IoSlice::new(b"world")];

    let mut write = socket
        .write_vectored(&bufs, Duration::ZERO, None)
        .boxed_local();

    assert!(write.poll_unpin(&mut noop_context()).is_pending());

    transport.finish_write(Ok(()));

    poll_ready(&mut write).unwrap();

    // one transport call for all buffers
    assert_eq!(transport.count("writev"), 1);
    assert_eq!(&transport.written.borrow()[..], b"hello world");
}

#[test]
fn test_partial_write() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut info = WriteInfo::default();

    let data = [7u8; 100];

    let result = {
        let mut write = socket
            .write(&data, Duration::ZERO, Some(&mut info))
            .boxed_local();

        assert!(write.poll_unpin(&mut noop_context()).is_pending());

        transport.finish_write(Err((30, io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))));

        poll_ready(&mut write)
    };

    match result {
        Err(Error::WriteFailed { bytes_written, .. }) => assert_eq!(bytes_written, 30),
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(info.bytes_written, 30);
}

#[test]
fn test_write_cancelled_in_flight() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let source = CancellationSource::new();

    let mut info = WriteInfo::default();

    let result = {
        let mut write = with_cancellation(
            source.token(),
            socket.write(b"hello", Duration::ZERO, Some(&mut info)),
        );

        assert!(write.poll_unpin(&mut noop_context()).is_pending());

        source.request_cancellation();
        source.request_cancellation();

        poll_ready(&mut write)
    };

    assert!(result.unwrap_err().is_cancelled());

    assert_eq!(transport.count("close_with_reset"), 1);
    assert_eq!(info.bytes_written, 0);
}

#[test]
fn test_cancellation_wins_over_completion() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let source = CancellationSource::new();

    let mut write = with_cancellation(
        source.token(),
        socket.write(b"hello", Duration::ZERO, None),
    );

    assert!(write.poll_unpin(&mut noop_context()).is_pending());

    transport.finish_write(Ok(()));

    // requested after the transport finished but before the writer resumed
    source.request_cancellation();

    assert!(poll_ready(&mut write).unwrap_err().is_cancelled());

    // already completed operations are not aborted
    assert_eq!(transport.count("close_with_reset"), 0);
}

#[test]
fn test_write_dropped_in_flight() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut write = socket.write(b"hello", Duration::ZERO, None).boxed_local();

    assert!(write.poll_unpin(&mut noop_context()).is_pending());

    drop(write);

    assert_eq!(transport.count("close_with_reset"), 1);
}

#[test]
fn test_write_dropped_after_success() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut write = socket.write(b"hello", Duration::ZERO, None).boxed_local();

    assert!(write.poll_unpin(&mut noop_context()).is_pending());

    transport.finish_write(Ok(()));

    // never polled again after the transport finished
    drop(write);

    assert_eq!(transport.count("close_with_reset"), 0);
    assert_eq!(&transport.written.borrow()[..], b"hello");
}

#[test]
fn test_read_dropped_after_data() {
    _ = pretty_env_logger::try_init();

    let (transport, mut socket) = connected();

    let mut buf = BytesMut::new();

    let mut read = socket
        .read_buf(&mut buf, 16, 64, Duration::from_secs(1))
        .boxed_local();

    assert!(read.poll_unpin(&mut noop_context()).is_pending());

    transport.deliver(b"abc");

    drop(read);

    assert!(!transport.has_read_callback());
    assert_eq!(transport.pending_timers(), 0);
    assert_eq!(transport.count("close_with_reset"), 0);
    assert_eq!(&buf[..], b"abc");
}
