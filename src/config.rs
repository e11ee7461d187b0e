//! Command-line surface and startup configuration.

use std::env;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

use crate::error::{HttpdError, HttpdResult};

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_INDEX_NAME: &str = "index.html";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "darkhttpd", version)]
#[command(about = "A small, single-threaded static file webserver")]
pub struct Cli {
    /// Path to the document root
    #[arg(value_name = "wwwroot")]
    pub root: String,

    /// Which port to listen on for connections
    #[arg(long, value_name = "number", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Which interface to bind the listening port to (default: all)
    #[arg(long, value_name = "ip")]
    pub addr: Option<IpAddr>,

    /// How many concurrent connections to accept (default: system maximum)
    #[arg(long, value_name = "number")]
    pub maxconn: Option<i32>,

    /// Which file to append the request log to (default: no logging)
    #[arg(long, value_name = "filename")]
    pub log: Option<PathBuf>,

    /// Lock the server into the wwwroot directory for added security
    #[arg(long)]
    pub chroot: bool,

    /// Default file to serve when a directory is requested
    #[arg(long, value_name = "filename", default_value = DEFAULT_INDEX_NAME)]
    pub index: String,

    /// Parse the specified file for extension-MIME associations
    #[arg(long, value_name = "filename")]
    pub mimetypes: Option<PathBuf>,

    /// Seconds a connection may stay idle before it is closed (0 disables)
    #[arg(long, value_name = "seconds", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub timeout: u64,
}

/// Validated startup configuration, built once in `main` and handed to
/// `Server::new`.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: String,
    pub addr: IpAddr,
    pub port: u16,
    pub max_connections: Option<i32>,
    pub log_path: Option<PathBuf>,
    pub want_chroot: bool,
    pub index_name: String,
    pub mimetypes_path: Option<PathBuf>,
    /// Idle timeout in seconds; 0 disables the sweep.
    pub idle_timeout: u64,
}

impl Config {
    pub fn from_cli(cli: Cli) -> HttpdResult<Self> {
        let mut root = expand_tilde(&cli.root)?;
        strip_endslash(&mut root);
        Ok(Self {
            root,
            addr: cli.addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: cli.port,
            max_connections: cli.maxconn,
            log_path: cli.log,
            want_chroot: cli.chroot,
            index_name: cli.index,
            mimetypes_path: cli.mimetypes,
            idle_timeout: cli.timeout,
        })
    }
}

/// `~/html` becomes `/home/user/html`.
fn expand_tilde(path: &str) -> HttpdResult<String> {
    if !path.starts_with('~') {
        return Ok(path.to_owned());
    }
    let home = home_dir().ok_or(HttpdError::NoHome)?;
    Ok(format!("{home}{}", &path[1..]))
}

fn home_dir() -> Option<String> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Some(home);
        }
    }
    // no environment variable, ask the password database
    unsafe {
        let pw = libc::getpwuid(libc::getuid());
        if pw.is_null() || (*pw).pw_dir.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned())
    }
}

/// Strip one trailing slash so the root can be glued onto sanitised URIs.
fn strip_endslash(path: &mut String) {
    if path.ends_with('/') {
        path.pop();
    }
}
