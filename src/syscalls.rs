//! Thin wrappers over the socket and readiness-polling syscalls.
//!
//! Everything network-facing is non-blocking; the only call that blocks is
//! `Epoll::wait`.  The poller is level-triggered: a socket that still has
//! pending work is reported again on the next tick, which is what the
//! one-step-per-tick state machine expects.

use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ---- Socket operations ----

/// Create the non-blocking listening socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: SocketAddr, backlog: c_int) -> io::Result<c_int> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        #[cfg(not(target_os = "linux"))]
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                #[cfg(target_os = "macos")]
                let sin = libc::sockaddr_in {
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                #[cfg(not(target_os = "macos"))]
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            SocketAddr::V6(a) => {
                #[cfg(target_os = "macos")]
                let sin6 = libc::sockaddr_in6 {
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                #[cfg(not(target_os = "macos"))]
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Accept one pending connection, returning its non-blocking socket and
/// the peer address, or `None` when the accept queue is empty.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<(c_int, IpAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    #[cfg(target_os = "linux")]
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        };
    }

    #[cfg(not(target_os = "linux"))]
    if let Err(e) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    Ok(Some((fd, sockaddr_ip(&storage))))
}

fn sockaddr_ip(storage: &libc::sockaddr_storage) -> IpAddr {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
        }
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

/// The address the listening socket is actually bound to; tells the
/// operator (and the tests) the real port when 0 was requested.
pub fn local_addr(fd: c_int) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    if unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    } < 0
    {
        return Err(io::Error::last_os_error());
    }
    let port = match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            u16::from_be(sin.sin_port)
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            u16::from_be(sin6.sin6_port)
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected address family {other}"),
            ));
        }
    };
    Ok(SocketAddr::new(sockaddr_ip(&storage), port))
}

/// Non-blocking read.  `None` means the socket would block, `Some(0)` is
/// end of stream (the peer closed).
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    } else {
        Ok(Some(res as usize))
    }
}

/// Non-blocking write with the same conventions as `read_nonblocking`.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<Option<usize>> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    } else {
        Ok(Some(res as usize))
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// A peer reset during a send must surface as a return value, not a
/// process-terminating signal.
pub fn ignore_sigpipe() -> io::Result<()> {
    let prev = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if prev == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---- Readiness polling (Linux) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    use std::ptr;

    pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, epoll_event};

    /// Level-triggered epoll instance.
    pub struct Epoll {
        fd: c_int,
    }

    impl Epoll {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::epoll_create1(0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            if unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
            Ok(())
        }

        /// Wait for readiness.  `timeout_ms` of -1 blocks indefinitely.
        /// An interrupted wait reports zero events.
        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
            let res = unsafe {
                libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
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

// ---- Readiness polling (kqueue fallback for macOS) ----

#[cfg(target_os = "macos")]
pub use macos_kqueue::*;

#[cfg(target_os = "macos")]
mod macos_kqueue {
    use super::*;
    use libc::{EV_ADD, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};
    use std::ptr;

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;
    pub const EPOLLERR: i32 = 8;
    pub const EPOLLHUP: i32 = 16;

    /// kqueue dressed up in the epoll interface.  Filters are registered
    /// without EV_CLEAR, so readiness is level-triggered here too.
    pub struct Epoll {
        fd: c_int,
    }

    impl Epoll {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { kqueue() };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            self.update(fd, token, interests)
        }

        /// kqueue filters are independent, so modifying means enabling the
        /// wanted filter and deleting the other.
        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            self.apply(fd, token, EPOLLIN, interests & EPOLLIN != 0)?;
            self.apply(fd, token, EPOLLOUT, interests & EPOLLOUT != 0)
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            // deleting filters that were never added is not an error here
            self.apply(fd, 0, EPOLLIN, false).ok();
            self.apply(fd, 0, EPOLLOUT, false).ok();
            Ok(())
        }

        fn update(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            if interests & EPOLLIN != 0 {
                self.apply(fd, token, EPOLLIN, true)?;
            }
            if interests & EPOLLOUT != 0 {
                self.apply(fd, token, EPOLLOUT, true)?;
            }
            Ok(())
        }

        fn apply(&self, fd: c_int, token: u64, interest: i32, enable: bool) -> io::Result<()> {
            let filter = if interest == EPOLLIN {
                EVFILT_READ
            } else {
                EVFILT_WRITE
            };
            let change = kevent {
                ident: fd as usize,
                filter,
                flags: if enable { EV_ADD | EV_ENABLE } else { EV_DELETE },
                fflags: 0,
                data: 0,
                udata: token as *mut c_void,
            };
            let res = unsafe { libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null()) };
            if res < 0 && enable {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = ts
                .as_ref()
                .map(|t| t as *const timespec)
                .unwrap_or(ptr::null());

            let res = unsafe {
                libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch as c_int,
                    ts_ptr,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }

            let n = res as usize;
            for i in 0..n {
                let mut flags = 0;
                if kevents[i].filter == EVFILT_READ {
                    flags |= EPOLLIN;
                }
                if kevents[i].filter == EVFILT_WRITE {
                    flags |= EPOLLOUT;
                }
                events[i] = epoll_event {
                    events: flags as u32,
                    u64: kevents[i].udata as u64,
                };
            }
            Ok(n)
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
