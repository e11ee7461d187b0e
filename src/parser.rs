//! Minimal HTTP request parsing.
//!
//! Runs once the request buffer ends in CRLFCRLF.  Only the method, the
//! request-target and a handful of header values are extracted; the HTTP
//! version and everything else in the header block is ignored on purpose.

/// The request fields the server cares about.  `method` is uppercased
/// ASCII; the header fields are `None` when absent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub uri: String,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Parse a request like `GET / HTTP/1.1` out of the accumulated buffer.
/// The parser is permissive: whatever precedes the first space is the
/// method, whatever follows it up to the next space or CR is the target.
pub fn parse_request(raw: &[u8]) -> ParsedRequest {
    let method_end = raw
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(raw.len());
    let method = String::from_utf8_lossy(&raw[..method_end]).to_ascii_uppercase();

    let uri = if raw.get(method_end) == Some(&b' ') {
        let uri_start = method_end + 1;
        let uri_end = raw[uri_start..]
            .iter()
            .position(|&b| b == b' ' || b == b'\r')
            .map(|p| uri_start + p)
            .unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[uri_start..uri_end]).into_owned()
    } else {
        String::new()
    };

    ParsedRequest {
        method,
        uri,
        referer: parse_field(raw, b"Referer: "),
        user_agent: parse_field(raw, b"User-Agent: "),
        if_modified_since: parse_field(raw, b"If-Modified-Since: "),
    }
}

/// Return the text between `field` and the next CR (or end of buffer).
fn parse_field(raw: &[u8], field: &[u8]) -> Option<String> {
    let start = raw
        .windows(field.len())
        .position(|window| window == field)?
        + field.len();
    let end = raw[start..]
        .iter()
        .position(|&b| b == b'\r')
        .map(|p| start + p)
        .unwrap_or(raw.len());
    Some(String::from_utf8_lossy(&raw[start..end]).into_owned())
}
