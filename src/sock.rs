//! Raw descriptor and socket plumbing.
//!
//! Everything here is a thin checked wrapper over the libc calls the
//! daemon actually issues: Bluetooth sockets for SCO, socket pairs for
//! GATT acquire handovers, pipes for client FIFOs. Higher layers wrap the
//! returned [OwnedFd] in `AsyncFd` and drive it through `try_io` guards.

use libc::{c_int, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK};
use std::{
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};
use tokio::io::ReadBuf;

/// File descriptor that is closed on drop.
#[derive(Debug)]
pub struct OwnedFd {
    fd: RawFd,
}

impl OwnedFd {
    /// Takes ownership of a raw descriptor.
    ///
    /// # Safety
    /// The descriptor must be open and not owned elsewhere.
    pub unsafe fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for OwnedFd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Turns a `-1` return into the pending OS error.
fn cvt(ret: c_int) -> Result<c_int> {
    if ret == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Like [cvt] for byte-count returns.
fn cvt_size(ret: isize) -> Result<usize> {
    if ret == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Opens a non-blocking, close-on-exec socket.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> Result<OwnedFd> {
    let fd = cvt(unsafe { libc::socket(domain, ty | SOCK_NONBLOCK | SOCK_CLOEXEC, protocol) })?;
    Ok(unsafe { OwnedFd::new(fd) })
}

/// Creates a pair of connected local sockets of the given type.
///
/// Both ends are non-blocking and close-on-exec.
pub fn socketpair(ty: c_int) -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    cvt(unsafe {
        libc::socketpair(libc::AF_LOCAL, ty | SOCK_NONBLOCK | SOCK_CLOEXEC, 0, fds.as_mut_ptr())
    })?;
    Ok(unsafe { (OwnedFd::new(fds[0]), OwnedFd::new(fds[1])) })
}

/// Creates a pipe with a non-blocking read end and a blocking write end.
///
/// The blocking write end provides backpressure when handed to a consumer
/// that drains at its own pace.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    let (rx, tx) = unsafe { (OwnedFd::new(fds[0]), OwnedFd::new(fds[1])) };
    set_nonblocking(&rx)?;
    Ok((rx, tx))
}

/// Switches a descriptor to non-blocking mode.
pub fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Binds a socket to a raw socket address structure.
pub fn bind<T>(fd: &OwnedFd, addr: &T) -> Result<()> {
    cvt(unsafe {
        libc::bind(fd.as_raw_fd(), addr as *const T as *const libc::sockaddr, size_of::<T>() as socklen_t)
    })?;
    Ok(())
}

/// Initiates a connection to a raw socket address structure.
///
/// On a non-blocking socket this typically returns `EINPROGRESS`; the
/// caller completes the connect by waiting for writability and reading
/// `SO_ERROR`.
pub fn connect<T>(fd: &OwnedFd, addr: &T) -> Result<()> {
    cvt(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            addr as *const T as *const libc::sockaddr,
            size_of::<T>() as socklen_t,
        )
    })?;
    Ok(())
}

/// Reads into the unfilled part of the buffer.
///
/// On sequential-packet sockets one call consumes one datagram.
pub fn read(fd: &OwnedFd, buf: &mut ReadBuf) -> Result<usize> {
    let unfilled = unsafe { buf.unfilled_mut() };
    let n = cvt_size(unsafe {
        libc::read(fd.as_raw_fd(), unfilled.as_mut_ptr() as *mut _, unfilled.len())
    })?;
    unsafe {
        buf.assume_init(n);
    }
    buf.advance(n);
    Ok(n)
}

/// Writes the buffer, returning how much was accepted.
///
/// On sequential-packet sockets the whole buffer goes out as one datagram.
pub fn write(fd: &OwnedFd, buf: &[u8]) -> Result<usize> {
    cvt_size(unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) })
}

/// Shuts down part of a socket.
pub fn shutdown(fd: &OwnedFd, how: c_int) -> Result<()> {
    cvt(unsafe { libc::shutdown(fd.as_raw_fd(), how) })?;
    Ok(())
}

/// Reads a socket option into a plain value.
pub fn getsockopt<T>(fd: &OwnedFd, level: c_int, name: c_int) -> Result<T> {
    let mut value: MaybeUninit<T> = MaybeUninit::uninit();
    let mut len: socklen_t = size_of::<T>() as _;
    cvt(unsafe { libc::getsockopt(fd.as_raw_fd(), level, name, value.as_mut_ptr() as *mut _, &mut len) })?;
    if len != size_of::<T>() as socklen_t {
        return Err(Error::new(ErrorKind::InvalidInput, "socket option size mismatch"));
    }
    Ok(unsafe { value.assume_init() })
}

/// Writes a socket option from a plain value.
pub fn setsockopt<T>(fd: &OwnedFd, level: c_int, name: c_int, value: &T) -> Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            value as *const T as *const _,
            size_of::<T>() as socklen_t,
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socketpair_round_trip() {
        let (a, b) = socketpair(libc::SOCK_SEQPACKET).unwrap();
        assert_eq!(write(&a, b"hello").unwrap(), 5);
        let mut storage = [0u8; 16];
        let mut buf = ReadBuf::new(&mut storage);
        assert_eq!(read(&b, &mut buf).unwrap(), 5);
        assert_eq!(buf.filled(), b"hello");
    }

    #[test]
    fn pipe_write_end_blocks_read_end_does_not() {
        let (rx, tx) = pipe().unwrap();
        let mut storage = [0u8; 4];
        let mut buf = ReadBuf::new(&mut storage);
        // empty non-blocking read end reports WouldBlock instead of hanging
        let err = read(&rx, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert_eq!(write(&tx, b"ab").unwrap(), 2);
        assert_eq!(read(&rx, &mut buf).unwrap(), 2);
    }

    #[test]
    fn into_raw_fd_releases_ownership() {
        let (a, _b) = pipe().unwrap();
        let raw = a.into_raw_fd();
        // still open: we took over the descriptor, so close it ourselves
        assert_eq!(unsafe { libc::close(raw) }, 0);
    }
}
