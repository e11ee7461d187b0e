use std::io;
use thiserror::Error;

/// Central error type for the server.
///
/// Only startup failures and readiness-poller failures surface here;
/// per-connection problems are resolved at request granularity (an HTTP
/// error reply) or connection granularity (a silent close) and never
/// terminate the process.
#[derive(Debug, Error)]
pub enum HttpdError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A `~` path was given but no home directory could be found.
    #[error("can't expand `~': no home directory")]
    NoHome,

    /// A startup step failed; `what` names the step for the operator.
    #[error("{what}: {source}")]
    Startup { what: String, source: io::Error },
}

pub type HttpdResult<T> = Result<T, HttpdError>;
