//! Tab-separated access log, one record per completed connection.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::conn::Connection;

pub struct AccessLog {
    out: BufWriter<File>,
}

impl AccessLog {
    /// Open the log file for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Append one record and flush it:
    /// `time client_ip method uri http_code bytes_sent "referer" "user-agent"`.
    pub fn write_record(&mut self, conn: &Connection, now: u64) -> io::Result<()> {
        writeln!(
            self.out,
            "{}\t{}\t{}\t{}\t{}\t{}\t\"{}\"\t\"{}\"",
            now,
            conn.client,
            conn.method,
            conn.uri,
            conn.http_code,
            conn.total_sent,
            conn.referer.as_deref().unwrap_or(""),
            conn.user_agent.as_deref().unwrap_or(""),
        )?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut log = AccessLog::open(&path).unwrap();

        let mut conn = Connection::new(-1, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 0);
        conn.method = "GET".to_owned();
        conn.uri = "/index.html".to_owned();
        conn.http_code = 200;
        conn.total_sent = 345;
        conn.referer = Some("http://example.com/".to_owned());
        conn.user_agent = Some("agent/1.0".to_owned());
        log.write_record(&conn, 1_046_390_528).unwrap();

        let mut silent = Connection::new(-1, IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        silent.method = "HEAD".to_owned();
        silent.uri = "/".to_owned();
        silent.http_code = 304;
        log.write_record(&silent, 1_046_390_529).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "1046390528\t10.1.2.3\tGET\t/index.html\t200\t345\t\"http://example.com/\"\t\"agent/1.0\""
        );
        // absent referer/user-agent come out as empty quoted strings
        assert_eq!(lines[1], "1046390529\t127.0.0.1\tHEAD\t/\t304\t0\t\"\"\t\"\"");
    }

    #[test]
    fn records_are_appended_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        for round in 0..2u64 {
            let mut log = AccessLog::open(&path).unwrap();
            let mut conn = Connection::new(-1, IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
            conn.method = "GET".to_owned();
            conn.uri = "/".to_owned();
            conn.http_code = 200;
            log.write_record(&conn, round).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
