//! Thin libc wrappers for non-blocking tcp sockets.

use std::{
    ffi::c_void,
    io::{Error, ErrorKind, Result},
    mem::size_of,
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use errno::{errno, set_errno};
use libc::*;
use os_socketaddr::OsSocketAddr;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

fn last_error() -> Error {
    let e = errno();

    set_errno(e);

    Error::from_raw_os_error(e.0)
}

fn cvt(ret: c_int) -> Result<c_int> {
    if ret < 0 {
        Err(last_error())
    } else {
        Ok(ret)
    }
}

unsafe fn setsockopt_int(fd: RawFd, level: c_int, name: c_int, value: c_int) -> Result<()> {
    cvt(setsockopt(
        fd,
        level,
        name,
        &value as *const c_int as *const c_void,
        size_of::<c_int>() as socklen_t,
    ))?;

    Ok(())
}

/// Put `fd` into non-blocking, close-on-exec mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = cvt(fcntl(fd, F_GETFL))?;

        cvt(fcntl(fd, F_SETFL, flags | O_NONBLOCK))?;

        let flags = cvt(fcntl(fd, F_GETFD))?;

        cvt(fcntl(fd, F_SETFD, flags | FD_CLOEXEC))?;

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        setsockopt_int(fd, SOL_SOCKET, SO_NOSIGPIPE, 1)?;
    }

    Ok(())
}

/// Create a non-blocking tcp socket for `addr`'s family.
pub fn tcp_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    };

    let fd = cvt(unsafe { socket(domain, SOCK_STREAM, IPPROTO_TCP) })?;

    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    set_nonblocking(fd.as_raw_fd())?;

    log::debug!("open tcp socket({})", fd.as_raw_fd());

    Ok(fd)
}

/// Start a connect. `Ok(true)` when it completed immediately, `Ok(false)`
/// when it is in progress.
pub fn connect(fd: RawFd, to: &SocketAddr) -> Result<bool> {
    let addr: OsSocketAddr = (*to).into();

    if unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) } < 0 {
        let err = last_error();

        return match err.raw_os_error() {
            Some(EINPROGRESS) | Some(EAGAIN) => Ok(false),
            Some(EISCONN) => Ok(true),
            _ => Err(err),
        };
    }

    Ok(true)
}

/// Fetch and clear the pending socket error (`SO_ERROR`).
pub fn take_error(fd: RawFd) -> Result<Option<Error>> {
    let mut err_no: c_int = 0;

    let mut len = size_of::<c_int>() as socklen_t;

    cvt(unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut err_no as *mut c_int as *mut c_void,
            &mut len,
        )
    })?;

    if err_no != 0 {
        Ok(Some(Error::from_raw_os_error(err_no)))
    } else {
        Ok(None)
    }
}

pub fn recv(fd: RawFd, buff: &mut [u8]) -> Result<usize> {
    loop {
        let len = unsafe { libc::recv(fd, buff.as_mut_ptr() as *mut c_void, buff.len(), 0) };

        if len >= 0 {
            log::trace!(target:"unix_net","fd({}) recv {}", fd, len);

            return Ok(len as usize);
        }

        let err = last_error();

        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn send(fd: RawFd, buff: &[u8]) -> Result<usize> {
    loop {
        let len = unsafe { libc::send(fd, buff.as_ptr() as *const c_void, buff.len(), SEND_FLAGS) };

        if len >= 0 {
            log::trace!(target:"unix_net","fd({}) send {}", fd, len);

            return Ok(len as usize);
        }

        let err = last_error();

        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn shutdown_write(fd: RawFd) -> Result<()> {
    cvt(unsafe { shutdown(fd, SHUT_WR) })?;

    Ok(())
}

/// Make the next close send RST instead of FIN.
pub fn set_linger_zero(fd: RawFd) -> Result<()> {
    let value = linger {
        l_onoff: 1,
        l_linger: 0,
    };

    cvt(unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_LINGER,
            &value as *const linger as *const c_void,
            size_of::<linger>() as socklen_t,
        )
    })?;

    Ok(())
}

pub fn set_send_buffer_size(fd: RawFd, size: usize) -> Result<()> {
    unsafe { setsockopt_int(fd, SOL_SOCKET, SO_SNDBUF, size.min(c_int::MAX as usize) as c_int) }
}

fn sockaddr_of(
    fd: RawFd,
    f: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
) -> Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };

    let mut len = size_of::<sockaddr_storage>() as socklen_t;

    cvt(unsafe { f(fd, &mut storage as *mut sockaddr_storage as *mut sockaddr, &mut len) })?;

    let addr = unsafe {
        OsSocketAddr::copy_from_raw(&storage as *const sockaddr_storage as *const sockaddr, len)
    };

    addr.into_addr()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unsupported address family"))
}

pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    sockaddr_of(fd, getsockname)
}

pub fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    sockaddr_of(fd, getpeername)
}

/// Create a non-blocking listening socket bound to `addr`.
pub fn tcp_listener(addr: &SocketAddr, backlog: u32) -> Result<OwnedFd> {
    let fd = tcp_socket(addr)?;

    let raw = fd.as_raw_fd();

    unsafe {
        setsockopt_int(raw, SOL_SOCKET, SO_REUSEADDR, 1)?;

        let os_addr: OsSocketAddr = (*addr).into();

        cvt(bind(raw, os_addr.as_ptr(), os_addr.len()))?;

        cvt(listen(raw, backlog.min(SOMAXCONN as u32) as c_int))?;
    }

    Ok(fd)
}

/// Accept one pending connection. The returned socket is non-blocking.
pub fn accept(fd: RawFd) -> Result<(OwnedFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };

    let mut len = size_of::<sockaddr_storage>() as socklen_t;

    let conn = loop {
        let conn = unsafe {
            libc::accept(
                fd,
                &mut storage as *mut sockaddr_storage as *mut sockaddr,
                &mut len,
            )
        };

        if conn >= 0 {
            break conn;
        }

        let err = last_error();

        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let conn = unsafe { OwnedFd::from_raw_fd(conn) };

    set_nonblocking(conn.as_raw_fd())?;

    let remote = unsafe {
        OsSocketAddr::copy_from_raw(&storage as *const sockaddr_storage as *const sockaddr, len)
    }
    .into_addr()
    .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unsupported address family"))?;

    log::trace!(target:"unix_net","fd({}) accept connection({}) from ({:?})", fd, conn.as_raw_fd(), remote);

    Ok((conn, remote))
}
