//! Response construction: status line, header block and body.
//!
//! Replies come in two shapes.  Error pages and 304s are generated HTML
//! held in memory; successful GETs hand the open file to the connection
//! and the send loop streams it with positioned reads.

use std::fs::File;
use std::io;
use std::time::SystemTime;

use tracing::debug;

use crate::conn::{Connection, Reply};
use crate::mime::MimeMap;
use crate::uri::{make_safe_uri, urldecode};

/// Sent in the `Server:` header and the error page footer.
pub const SERVER_NAME: &str = "darkhttpd/0.1";

/// RFC 1123 timestamp in GMT, e.g. `Fri, 28 Feb 2003 00:02:08 GMT`.
pub fn rfc1123_date(when: SystemTime) -> String {
    httpdate::fmt_http_date(when)
}

/// Build the header and reply for a parsed request and leave them on the
/// connection.  The caller advances the state machine.
pub fn process_request(conn: &mut Connection, root: &str, index_name: &str, mime: &MimeMap) {
    match conn.method.as_str() {
        "GET" => process_get(conn, root, index_name, mime),
        "HEAD" => {
            process_get(conn, root, index_name, mime);
            conn.header_only = true;
        }
        "OPTIONS" | "POST" | "PUT" | "DELETE" | "TRACE" | "CONNECT" => {
            let reason = format!(
                "The method you specified ({}) is not implemented.",
                conn.method
            );
            error_reply(conn, 501, "Not Implemented", &reason);
        }
        _ => {
            let reason = format!("{} is not a valid HTTP/1.1 method.", conn.method);
            error_reply(conn, 400, "Bad Request", &reason);
        }
    }
}

/// Handle GET and HEAD: decode and sanitise the target, open the file,
/// honour `If-Modified-Since`, and build a 200 header for the stream.
fn process_get(conn: &mut Connection, root: &str, index_name: &str, mime: &MimeMap) {
    let decoded = match String::from_utf8(urldecode(&conn.uri)) {
        Ok(decoded) => decoded,
        Err(_) => {
            let reason = format!("You requested an invalid URI: {}", conn.uri);
            error_reply(conn, 400, "Bad Request", &reason);
            return;
        }
    };

    let Some(safe_uri) = make_safe_uri(&decoded) else {
        let reason = format!("You requested an invalid URI: {}", conn.uri);
        error_reply(conn, 400, "Bad Request", &reason);
        return;
    };

    // a trailing slash means the directory's index file
    let (target, mimetype) = if safe_uri.ends_with('/') {
        (
            format!("{root}{safe_uri}{index_name}"),
            mime.content_type(index_name),
        )
    } else {
        (format!("{root}{safe_uri}"), mime.content_type(&safe_uri))
    };
    debug!(uri = %conn.uri, %target, content_type = mimetype, "resolved target");

    let file = match File::open(&target) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let reason = format!("The URI you requested ({}) was not found.", conn.uri);
            error_reply(conn, 404, "Not Found", &reason);
            return;
        }
        Err(e) => {
            let reason = format!(
                "The URI you requested ({}) cannot be returned.<br>\n{e}.",
                conn.uri
            );
            error_reply(conn, 403, "Forbidden", &reason);
            return;
        }
    };

    let metadata = match file.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            let reason = format!("fstat() failed: {e}.");
            error_reply(conn, 500, "Internal Server Error", &reason);
            return;
        }
    };
    if metadata.is_dir() {
        let reason = format!(
            "The URI you requested ({}) cannot be returned.<br>\nIs a directory.",
            conn.uri
        );
        error_reply(conn, 403, "Forbidden", &reason);
        return;
    }

    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let lastmod = rfc1123_date(modified);

    // may not have to send the file at all
    if conn.if_modified_since.as_deref() == Some(lastmod.as_str()) {
        debug!(lastmod = %lastmod, "not modified");
        conn.lastmod = Some(lastmod);
        error_reply(conn, 304, "Not Modified", "");
        conn.header_only = true;
        return;
    }

    let length = metadata.len();
    conn.header = format!(
        "HTTP/1.1 200 OK\r\n\
         Date: {date}\r\n\
         Server: {SERVER_NAME}\r\n\
         Connection: close\r\n\
         Content-Length: {length}\r\n\
         Content-Type: {mimetype}\r\n\
         Last-Modified: {lastmod}\r\n\
         \r\n",
        date = rfc1123_date(SystemTime::now()),
    )
    .into_bytes();
    conn.http_code = 200;
    conn.lastmod = Some(lastmod);
    conn.reply = Reply::FromFile {
        file,
        length,
        sent: 0,
    };
}

/// A generated reply for any (erroneous) occasion.
pub fn error_reply(conn: &mut Connection, code: u16, name: &str, reason: &str) {
    let date = rfc1123_date(SystemTime::now());
    let body = format!(
        "<html><head><title>{code} {name}</title></head><body>\n\
         <h1>{name}</h1>\n\
         {reason}\n\
         <hr>\n\
         Generated by {SERVER_NAME} on {date}\n\
         </body></html>\n"
    );
    conn.header = format!(
        "HTTP/1.1 {code} {name}\r\n\
         Date: {date}\r\n\
         Server: {SERVER_NAME}\r\n\
         Connection: close\r\n\
         Content-Length: {length}\r\n\
         Content-Type: text/html\r\n\
         \r\n",
        length = body.len(),
    )
    .into_bytes();
    conn.reply = Reply::Generated {
        buf: body.into_bytes(),
        sent: 0,
    };
    conn.http_code = code;
}
