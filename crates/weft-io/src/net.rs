//! Fiber-blocking TCP wrappers
//!
//! `TcpListener` / `TcpStream` give straight-line socket code over the hook
//! layer: every call that would block parks the calling fiber, not the
//! worker thread. Meant to be used from fibers running on an
//! [`IoScheduler`](crate::reactor::IoScheduler) worker, where the hook flag
//! is enabled.

use std::net::Ipv4Addr;

use libc::{c_int, c_void, sockaddr, sockaddr_in, socklen_t};
use weft_core::{WeftError, WeftResult};

use crate::hook;

#[inline]
fn last_errno() -> WeftError {
    WeftError::Os(unsafe { *libc::__errno_location() })
}

fn ipv4_addr(ip: Ipv4Addr, port: u16) -> sockaddr_in {
    let mut addr: sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as u16;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr
}

/// A listening TCP socket whose `accept` parks the calling fiber
pub struct TcpListener {
    fd: c_int,
}

impl TcpListener {
    /// Bind and listen on `ip:port` with SO_REUSEADDR. Port 0 picks an
    /// ephemeral port; see [`TcpListener::local_port`].
    pub fn bind(ip: Ipv4Addr, port: u16) -> WeftResult<TcpListener> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(last_errno());
        }

        unsafe {
            let opt: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as socklen_t,
            );
        }

        let addr = ipv4_addr(ip, port);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const sockaddr_in as *const sockaddr,
                std::mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        if rc != 0 {
            let err = last_errno();
            hook::close(fd);
            return Err(err);
        }

        if unsafe { libc::listen(fd, 1024) } != 0 {
            let err = last_errno();
            hook::close(fd);
            return Err(err);
        }

        Ok(TcpListener { fd })
    }

    /// The port the kernel actually bound
    pub fn local_port(&self) -> u16 {
        let mut addr: sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<sockaddr_in>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut addr as *mut sockaddr_in as *mut sockaddr, &mut len)
        };
        if rc != 0 {
            return 0;
        }
        u16::from_be(addr.sin_port)
    }

    /// Park until a client connects
    pub fn accept(&self) -> WeftResult<TcpStream> {
        let mut addr: sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<sockaddr_in>() as socklen_t;
        let fd = unsafe {
            hook::accept(self.fd, &mut addr as *mut sockaddr_in as *mut sockaddr, &mut len)
        };
        if fd < 0 {
            return Err(last_errno());
        }
        Ok(TcpStream { fd })
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A connected TCP socket whose reads and writes park the calling fiber
pub struct TcpStream {
    fd: c_int,
}

impl TcpStream {
    /// Connect to `ip:port`, honoring the process-wide connect timeout
    pub fn connect(ip: Ipv4Addr, port: u16) -> WeftResult<TcpStream> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(last_errno());
        }

        let addr = ipv4_addr(ip, port);
        let rc = unsafe {
            hook::connect(
                fd,
                &addr as *const sockaddr_in as *const sockaddr,
                std::mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        if rc != 0 {
            let err = WeftError::ConnectFailed(unsafe { *libc::__errno_location() });
            hook::close(fd);
            return Err(err);
        }
        Ok(TcpStream { fd })
    }

    /// Receive into `buf`; 0 means the peer closed, negative is -errno
    pub fn read(&self, buf: &mut [u8]) -> isize {
        let n = unsafe { hook::recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n < 0 {
            -unsafe { *libc::__errno_location() } as isize
        } else {
            n as isize
        }
    }

    /// Send from `buf`; returns bytes sent or -errno
    pub fn write(&self, buf: &[u8]) -> isize {
        let n = unsafe { hook::send(self.fd, buf.as_ptr() as *const c_void, buf.len(), 0) };
        if n < 0 {
            -unsafe { *libc::__errno_location() } as isize
        } else {
            n as isize
        }
    }

    /// Send all of `buf`, parking as needed
    pub fn write_all(&self, buf: &[u8]) -> WeftResult<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.write(&buf[sent..]);
            if n <= 0 {
                return Err(WeftError::Os(-n as i32));
            }
            sent += n as usize;
        }
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}
