use std::{io, net::SocketAddr, rc::Rc};

use crate::{
    reactor::EventBase,
    transport::{AcceptCallback, AsyncServerSocket, AsyncSocket},
    Error, Result,
};

use super::{
    completion::{complete, AcceptCompletion, Completion},
    Socket,
};

/// Listening socket whose [`accept`](ServerSocket::accept) is an `async fn`.
#[derive(Debug)]
pub struct ServerSocket {
    transport: Rc<AsyncServerSocket>,
}

impl ServerSocket {
    pub fn bind(evb: &EventBase, addr: SocketAddr, backlog: u32) -> io::Result<Self> {
        Ok(Self::new(AsyncServerSocket::bind(evb, addr, backlog)?))
    }

    pub fn new(transport: Rc<AsyncServerSocket>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Rc<AsyncServerSocket> {
        &self.transport
    }

    pub fn local_address(&self) -> SocketAddr {
        self.transport.local_address()
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&mut self) -> Result<Socket> {
        let completion = Rc::new(AcceptCompletion::new(self.transport.clone()));

        let transport = &self.transport;

        let resumed = complete(&completion, || {
            let callback: Rc<dyn AcceptCallback> = completion.clone();

            transport.set_accept_callback(Some(callback));
        })
        .await;

        if completion.signal().is_issued() {
            transport.set_accept_callback(None);
        }

        let (conn, remote) = resumed.resolve(|| completion.result()).into_result()?;

        log::trace!("accepted connection from {}", remote);

        let socket =
            AsyncSocket::from_fd(transport.event_base(), conn).map_err(Error::AcceptFailed)?;

        Ok(Socket::new(socket))
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}
