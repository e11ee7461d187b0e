//! The event loop and per-connection state machine.
//!
//! One tick: sweep the connection set (idle timeouts, then releasing
//! everything a `Done` connection owns), wait on the readiness poller,
//! accept if the listener fired, and step each ready connection through
//! `RecvRequest -> SendHeader -> SendReply -> Done`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use libc::c_int;
use tracing::{debug, info, trace, warn};

use crate::accesslog::AccessLog;
use crate::config::Config;
use crate::conn::{Connection, ConnState, MAX_REQUEST_LENGTH, Reply};
use crate::error::{HttpdError, HttpdResult};
use crate::mime::MimeMap;
use crate::slab::ConnectionSlab;
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, Epoll, epoll_event};
use crate::{parser, response};

/// Token reserved for the listening socket; connection tokens are slab
/// indices, which stay far below this.
const LISTEN_TOKEN: u64 = u64::MAX;
/// Events processed per wait.
const EVENT_BATCH: usize = 1024;
/// Bytes read from a socket per recv step.
const RECV_BUFSIZE: usize = 65536;
/// Bytes read from a reply file per send step.
const FILE_CHUNK: usize = 65000;
/// Connection slots when --maxconn is not given.
const DEFAULT_CAPACITY: usize = 1024;

/// The whole server: listener, poller, connection set, MIME map, access
/// log and the bits of configuration the request path needs.  Constructed
/// once in `main` and torn down on drop.
pub struct Server {
    listen_fd: c_int,
    epoll: Epoll,
    slab: ConnectionSlab,
    events: Vec<epoll_event>,
    mime: MimeMap,
    log: Option<AccessLog>,
    root: String,
    index_name: String,
    idle_timeout: u64,
}

impl Server {
    pub fn new(config: &Config) -> HttpdResult<Self> {
        let mut mime = MimeMap::with_defaults();
        if let Some(path) = &config.mimetypes_path {
            mime.load_file(path)?;
        }

        let epoll = Epoll::new().map_err(|e| HttpdError::Startup {
            what: "can't create readiness poller".to_owned(),
            source: e,
        })?;

        let addr = SocketAddr::new(config.addr, config.port);
        let backlog = config.max_connections.unwrap_or(libc::SOMAXCONN);
        let listen_fd =
            syscalls::create_listen_socket(addr, backlog).map_err(|e| HttpdError::Startup {
                what: format!("can't listen on {addr}"),
                source: e,
            })?;
        epoll
            .add(listen_fd, LISTEN_TOKEN, EPOLLIN)
            .map_err(|e| HttpdError::Startup {
                what: "can't register listening socket".to_owned(),
                source: e,
            })?;

        let log = match &config.log_path {
            Some(path) => Some(AccessLog::open(path).map_err(|e| HttpdError::Startup {
                what: format!("can't open log file {}", path.display()),
                source: e,
            })?),
            None => None,
        };

        let capacity = config
            .max_connections
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_CAPACITY);

        Ok(Self {
            listen_fd,
            epoll,
            slab: ConnectionSlab::new(capacity),
            events: vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH],
            mime,
            log,
            root: config.root.clone(),
            index_name: config.index_name.clone(),
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        syscalls::local_addr(self.listen_fd)
    }

    /// Run ticks until the shutdown flag is raised, then drain whatever is
    /// still connected.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> HttpdResult<()> {
        if let Ok(addr) = self.local_addr() {
            info!("listening on http://{addr}/");
        }
        while !shutdown.load(Ordering::Acquire) {
            self.tick()?;
        }
        info!(connections = self.slab.len(), "shutting down");
        let now = unix_now();
        for idx in 0..self.slab.capacity() {
            if let Some(conn) = self.slab.remove(idx) {
                self.epoll.delete(conn.fd).ok();
                self.finish(conn, now);
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> HttpdResult<()> {
        let now = unix_now();

        // sweep: force idle connections to Done, then release Done ones
        let mut live = 0usize;
        for idx in 0..self.slab.capacity() {
            let done = {
                let Some(conn) = self.slab.get_mut(idx) else {
                    continue;
                };
                if conn.state != ConnState::Done
                    && self.idle_timeout > 0
                    && now.saturating_sub(conn.last_active) >= self.idle_timeout
                {
                    debug!(fd = conn.fd, "idle timeout caused closure");
                    conn.state = ConnState::Done;
                }
                conn.state == ConnState::Done
            };
            if done {
                if let Some(conn) = self.slab.remove(idx) {
                    self.epoll.delete(conn.fd).ok();
                    self.finish(conn, now);
                }
            } else {
                live += 1;
            }
        }

        // the timeout only matters while a connection could go idle
        let timeout_ms: c_int = if live > 0 && self.idle_timeout > 0 {
            self.idle_timeout.saturating_mul(1000).min(i32::MAX as u64) as c_int
        } else {
            -1
        };

        let ready = self.epoll.wait(&mut self.events, timeout_ms)?;

        for i in 0..ready {
            let event = self.events[i];
            let flags = event.events as i32;
            let readable = flags & (EPOLLIN | EPOLLERR | EPOLLHUP) != 0;
            let writable = flags & (EPOLLOUT | EPOLLERR | EPOLLHUP) != 0;

            if event.u64 == LISTEN_TOKEN {
                if readable {
                    self.accept_connection(now);
                }
                continue;
            }

            let idx = event.u64 as usize;
            let Some(state) = self.slab.get(idx).map(|conn| conn.state) else {
                continue;
            };
            match state {
                ConnState::RecvRequest if readable => self.poll_recv_request(idx, now),
                ConnState::SendHeader if writable => self.poll_send_header(idx, now),
                ConnState::SendReply if writable => self.poll_send_reply(idx, now),
                _ => {}
            }
        }
        Ok(())
    }

    /// Take one connection off the accept queue.  A level-triggered poll
    /// reports the listener again if more are pending.
    fn accept_connection(&mut self, now: u64) {
        match syscalls::accept_connection(self.listen_fd) {
            Ok(Some((fd, client))) => {
                debug!(fd, %client, "accepted connection");
                match self.slab.insert(Connection::new(fd, client, now)) {
                    Some(idx) => {
                        if let Err(e) = self.epoll.add(fd, idx as u64, EPOLLIN) {
                            warn!("can't register client socket: {e}");
                            self.slab.remove(idx);
                            syscalls::close_fd(fd);
                        }
                    }
                    None => {
                        warn!("connection capacity reached, dropping client");
                        syscalls::close_fd(fd);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("accept() failed: {e}"),
        }
    }

    /// Receiving request.
    fn poll_recv_request(&mut self, idx: usize, now: u64) {
        let Some(conn) = self.slab.get_mut(idx) else {
            return;
        };
        let mut buf = [0u8; RECV_BUFSIZE];
        let received = match syscalls::read_nonblocking(conn.fd, &mut buf) {
            Ok(Some(0)) => {
                // socket closed on us
                conn.state = ConnState::Done;
                return;
            }
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(e) => {
                debug!(fd = conn.fd, "recv failed: {e}");
                conn.state = ConnState::Done;
                return;
            }
        };
        trace!(fd = conn.fd, bytes = received, "recv");
        conn.last_active = now;
        conn.request.extend_from_slice(&buf[..received]);

        if conn.request.len() > MAX_REQUEST_LENGTH {
            response::error_reply(
                conn,
                413,
                "Request Entity Too Large",
                "Your request was dropped because it was too long.",
            );
        } else if conn.request.ends_with(b"\r\n\r\n") {
            let parsed = parser::parse_request(&conn.request);
            conn.method = parsed.method;
            conn.uri = parsed.uri;
            conn.referer = parsed.referer;
            conn.user_agent = parsed.user_agent;
            conn.if_modified_since = parsed.if_modified_since;
            response::process_request(conn, &self.root, &self.index_name, &self.mime);
        } else {
            return;
        }

        // request not needed anymore
        conn.request = Vec::new();
        conn.state = ConnState::SendHeader;
        if self.epoll.modify(conn.fd, idx as u64, EPOLLOUT).is_err() {
            conn.state = ConnState::Done;
        }
    }

    /// Sending generated header.
    fn poll_send_header(&mut self, idx: usize, now: u64) {
        let Some(conn) = self.slab.get_mut(idx) else {
            return;
        };
        let sent = match syscalls::write_nonblocking(conn.fd, &conn.header[conn.header_sent..]) {
            Ok(Some(0)) => {
                conn.state = ConnState::Done;
                return;
            }
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(e) => {
                debug!(fd = conn.fd, "send failed: {e}");
                conn.state = ConnState::Done;
                return;
            }
        };
        trace!(fd = conn.fd, bytes = sent, "send header");
        conn.last_active = now;
        conn.header_sent += sent;
        conn.total_sent += sent as u64;

        if conn.header_sent == conn.header.len() {
            conn.state = if conn.header_only {
                ConnState::Done
            } else {
                ConnState::SendReply
            };
        }
    }

    /// Sending reply, from memory or from the open file.
    fn poll_send_reply(&mut self, idx: usize, now: u64) {
        let Some(conn) = self.slab.get_mut(idx) else {
            return;
        };
        let fd = conn.fd;
        let wrote = match &mut conn.reply {
            Reply::Generated { buf, sent } => {
                match syscalls::write_nonblocking(fd, &buf[*sent..]) {
                    Ok(Some(0)) => {
                        conn.state = ConnState::Done;
                        return;
                    }
                    Ok(Some(n)) => {
                        *sent += n;
                        n
                    }
                    Ok(None) => return,
                    Err(e) => {
                        debug!(fd, "send failed: {e}");
                        conn.state = ConnState::Done;
                        return;
                    }
                }
            }
            Reply::FromFile { file, length, sent } => {
                let chunk = (*length - *sent).min(FILE_CHUNK as u64) as usize;
                let mut buf = [0u8; FILE_CHUNK];
                let read = match file.read_at(&mut buf[..chunk], *sent) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(fd, "reply file read failed: {e}");
                        conn.state = ConnState::Done;
                        return;
                    }
                };
                if read == 0 {
                    // the file shrank underneath us; the length can never
                    // be reached, so give up on the connection
                    conn.state = ConnState::Done;
                    return;
                }
                match syscalls::write_nonblocking(fd, &buf[..read]) {
                    Ok(Some(0)) => {
                        conn.state = ConnState::Done;
                        return;
                    }
                    Ok(Some(n)) => {
                        *sent += n as u64;
                        n
                    }
                    Ok(None) => return,
                    Err(e) => {
                        debug!(fd, "send failed: {e}");
                        conn.state = ConnState::Done;
                        return;
                    }
                }
            }
            Reply::None => {
                conn.state = ConnState::Done;
                return;
            }
        };
        trace!(fd, bytes = wrote, "send reply");
        conn.last_active = now;
        conn.total_sent += wrote as u64;

        if conn.reply.sent() >= conn.reply.length() {
            // release the body now: buffer freed or file closed
            conn.reply = Reply::None;
            conn.state = ConnState::Done;
        }
    }

    /// Emit the access-log record and release the socket.  Everything else
    /// the connection owns goes with the drop.
    fn finish(&mut self, conn: Connection, now: u64) {
        if conn.http_code != 0 {
            if let Some(log) = self.log.as_mut() {
                if let Err(e) = log.write_record(&conn, now) {
                    warn!("access log write failed: {e}");
                }
            }
        }
        trace!(
            fd = conn.fd,
            code = conn.http_code,
            sent = conn.total_sent,
            "connection closed"
        );
        syscalls::close_fd(conn.fd);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
