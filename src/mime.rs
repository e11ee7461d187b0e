//! Extension to media-type mapping.
//!
//! The map is an ordered list searched linearly; the first entry whose
//! extension matches the end of the URI wins, so insertion order matters.
//! A compiled-in defaults table is loaded first and an optional mime.types
//! file is appended after it.

use std::fs;
use std::path::Path;

use crate::error::{HttpdError, HttpdResult};

pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

// Linear search means the common types should come first.
const DEFAULT_EXTENSION_MAP: &[&str] = &[
    "text/html          html htm",
    "image/png          png",
    "image/jpeg         jpeg jpe jpg",
    "image/gif          gif",
    "audio/mpeg         mp2 mp3 mpga",
    "application/ogg    ogg",
    "text/css           css",
    "text/plain         txt asc",
    "text/xml           xml",
    "video/mpeg         mpeg mpe mpg",
    "video/x-msvideo    avi",
];

#[derive(Debug, Clone)]
struct MimeMapping {
    extension: String,
    mimetype: String,
}

#[derive(Debug, Clone)]
pub struct MimeMap {
    entries: Vec<MimeMapping>,
}

impl MimeMap {
    /// Build a map holding only the compiled-in defaults.
    pub fn with_defaults() -> Self {
        let mut map = Self { entries: Vec::new() };
        for line in DEFAULT_EXTENSION_MAP {
            map.parse_line(line);
        }
        map
    }

    /// Parse one mime.types line: a media type followed by the extensions
    /// that map to it.  Comments (`#`) and blank lines are ignored, as are
    /// lines with no extensions.
    pub fn parse_line(&mut self, line: &str) {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let mut tokens = line.split_whitespace();
        let Some(mimetype) = tokens.next() else {
            return;
        };
        for extension in tokens {
            self.entries.push(MimeMapping {
                extension: extension.to_owned(),
                mimetype: mimetype.to_owned(),
            });
        }
    }

    /// Append the contents of a mime.types file.  Failure to read the file
    /// is a startup error.
    pub fn load_file(&mut self, path: &Path) -> HttpdResult<()> {
        let contents = fs::read_to_string(path).map_err(|e| HttpdError::Startup {
            what: format!("can't read mime.types file {}", path.display()),
            source: e,
        })?;
        for line in contents.lines() {
            self.parse_line(line);
        }
        Ok(())
    }

    /// Determine a `Content-Type:` for a requested URI.  The extension must
    /// follow a dot that itself follows at least one byte of file name, and
    /// the comparison is case-sensitive.
    pub fn content_type(&self, uri: &str) -> &str {
        let uri = uri.as_bytes();
        for mapping in &self.entries {
            let ext = mapping.extension.as_bytes();
            // "/a." + "ext" is the shortest URI that can match
            if uri.len() >= ext.len() + 3
                && uri[uri.len() - 1 - ext.len()] == b'.'
                && uri.ends_with(ext)
            {
                return &mapping.mimetype;
            }
        }
        DEFAULT_MIMETYPE
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
