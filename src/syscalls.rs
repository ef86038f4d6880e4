// src/syscalls.rs
//! Thin non-blocking socket and event-queue adapter over libc: listen,
//! accept, read, write, writev, sendfile, peer lookup, and an epoll
//! instance (kqueue-backed on macOS). Everything above this module is
//! platform-independent.

use crate::error::UvhttpResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    /// Peer closed its write side.
    Eof,
}

/// Outcome of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
}

/// Create a non-blocking TCP listener with `SO_REUSEPORT`, so every
/// worker can bind its own copy of the same address.
///
/// Linux additionally gets `TCP_DEFER_ACCEPT` (skip wakeups for dataless
/// connections) and `TCP_NODELAY` on the listener, which accepted sockets
/// inherit.
pub fn create_listen_socket(host: &str, port: u16) -> UvhttpResult<c_int> {
    let addr: std::net::SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(target_os = "macos")]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        #[cfg(target_os = "macos")]
        if set_nonblocking(fd).is_err() {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // Inherited by accepted sockets.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        #[cfg(target_os = "linux")]
        {
            let defer_secs: c_int = 1;
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &defer_secs as *const _ as *const c_void,
                mem::size_of_val(&defer_secs) as socklen_t,
            );
        }

        #[cfg(target_os = "macos")]
        {
            // No MSG_NOSIGNAL on macOS; suppress SIGPIPE at the socket.
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, 8192) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> UvhttpResult<()> {
    unsafe {
        let rc = match addr {
            std::net::SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            std::net::SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                sin6.sin6_scope_id = a.scope_id();
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn set_nonblocking(fd: c_int) -> Result<(), ()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(());
        }
    }
    Ok(())
}

/// Accept one pending connection, or `None` when the queue is drained.
pub fn accept_connection(listen_fd: c_int) -> UvhttpResult<Option<c_int>> {
    #[cfg(target_os = "linux")]
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            // TCP_NODELAY is inherited from the listener.
            Ok(Some(fd))
        }
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            if set_nonblocking(fd).is_err() {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
            Ok(Some(fd))
        }
    }
}

/// Locally bound port of a socket; resolves ephemeral binds.
pub fn local_port(fd: c_int) -> Option<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return None;
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                Some(u16::from_be(sin.sin_port))
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                Some(u16::from_be(sin6.sin6_port))
            }
            _ => None,
        }
    }
}

/// Textual peer address ("203.0.113.5" or "2001:db8::1") of a connected
/// socket.
pub fn peer_addr(fd: c_int) -> Option<String> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return None;
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                let ip = IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                Some(ip.to_string())
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                let ip = IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr));
                Some(ip.to_string())
            }
            _ => None,
        }
    }
}

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> UvhttpResult<ReadOutcome> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
                _ => Err(err.into()),
            }
        } else if res == 0 {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::Data(res as usize))
        }
    }
}

pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> UvhttpResult<WriteOutcome> {
    unsafe {
        #[cfg(target_os = "linux")]
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        #[cfg(target_os = "macos")]
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
                io::ErrorKind::Interrupted => Ok(WriteOutcome::WouldBlock),
                _ => Err(err.into()),
            }
        } else {
            Ok(WriteOutcome::Wrote(res as usize))
        }
    }
}

/// Vectored write: headers and a shared cached body go out in one syscall
/// without concatenating them first. At most 8 segments.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> UvhttpResult<WriteOutcome> {
    if bufs.is_empty() {
        return Ok(WriteOutcome::Wrote(0));
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (i, buf) in bufs.iter().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
                io::ErrorKind::Interrupted => Ok(WriteOutcome::WouldBlock),
                _ => Err(err.into()),
            }
        } else {
            Ok(WriteOutcome::Wrote(res as usize))
        }
    }
}

/// Kernel file→socket copy of up to `count` bytes starting at `*offset`.
/// Advances `*offset` by the bytes sent.
pub fn sendfile_nonblocking(
    socket_fd: c_int,
    file_fd: c_int,
    offset: &mut u64,
    count: usize,
) -> UvhttpResult<WriteOutcome> {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut off = *offset as libc::off_t;
        let res = libc::sendfile(socket_fd, file_fd, &mut off, count);
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
                io::ErrorKind::Interrupted => Ok(WriteOutcome::WouldBlock),
                _ => Err(err.into()),
            }
        } else {
            *offset = off as u64;
            Ok(WriteOutcome::Wrote(res as usize))
        }
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let mut len = count as libc::off_t;
        let res = libc::sendfile(
            file_fd,
            socket_fd,
            *offset as libc::off_t,
            &mut len,
            ptr::null_mut(),
            0,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            // macOS reports the bytes it managed to queue even on EAGAIN.
            if err.kind() == io::ErrorKind::WouldBlock {
                if len > 0 {
                    *offset += len as u64;
                    return Ok(WriteOutcome::Wrote(len as usize));
                }
                return Ok(WriteOutcome::WouldBlock);
            }
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(WriteOutcome::WouldBlock);
            }
            Err(err.into())
        } else {
            *offset += len as u64;
            Ok(WriteOutcome::Wrote(len as usize))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ── Epoll (Linux) ──

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    pub use libc::epoll_event;
    use libc::{EPOLLET, EPOLLIN as LIBC_EPOLLIN, EPOLLOUT as LIBC_EPOLLOUT};

    pub const EPOLLIN: i32 = LIBC_EPOLLIN as i32;
    pub const EPOLLOUT: i32 = LIBC_EPOLLOUT as i32;

    /// Edge-triggered epoll instance. Callers must drain reads and writes
    /// to `WouldBlock` on every event.
    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> UvhttpResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> UvhttpResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> UvhttpResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> UvhttpResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET as i32) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> UvhttpResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> UvhttpResult<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ── Kqueue shim with the epoll surface (macOS development) ──

#[cfg(target_os = "macos")]
pub use macos_epoll::*;

#[cfg(target_os = "macos")]
mod macos_epoll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> UvhttpResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> UvhttpResult<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> UvhttpResult<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> UvhttpResult<()> {
            self.modify_kqueue(fd, 0, EPOLLIN | EPOLLOUT, EV_DELETE)
        }

        fn modify_kqueue(&self, fd: c_int, token: u64, interests: i32, action: u16) -> UvhttpResult<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;

            if (interests & EPOLLIN) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & EPOLLOUT) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }

            unsafe {
                let res = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                // Deleting filters that were never added is not an error.
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> UvhttpResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch_size = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = match &ts {
                Some(t) => t as *const timespec,
                None => ptr::null(),
            };

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch_size as c_int,
                    ts_ptr,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ep_ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ep_ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ep_ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event {
                        events: ep_ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
