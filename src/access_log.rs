//! Engine access-log parsing
//!
//! A relevant line looks like
//! `2024/01/15 12:00:00.123456 from tcp:203.0.113.5:41000 accepted tcp:example.com:443 [in-443 -> direct] email: alice@example.com`

use crate::error::{CoreError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

static SOURCE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"from (?:tcp:|udp:)?\[?([0-9a-fA-F\.:]+)\]?:\d+ accepted").unwrap()
});

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"email: ([^ ]+)").unwrap());

static TIMESTAMP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?)").unwrap()
});

/// One (client, source IP) sighting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub client: String,
    pub ip: String,
    /// Line timestamp, if the line carried one
    pub seen_at: Option<DateTime<Local>>,
}

/// Parse a single access-log line.
///
/// Lines without a source IP or an email, and loopback sources, yield `None`.
pub fn parse_line(line: &str) -> Option<Observation> {
    let ip_raw = SOURCE_PATTERN.captures(line)?.get(1)?.as_str();
    let client = EMAIL_PATTERN.captures(line)?.get(1)?.as_str().trim();
    if client.is_empty() {
        return None;
    }

    let ip: IpAddr = ip_raw.parse().ok()?;
    if ip.is_loopback() {
        return None;
    }

    Some(Observation {
        client: client.to_string(),
        ip: ip.to_string(),
        seen_at: parse_timestamp(line),
    })
}

/// Leading `YYYY/MM/DD HH:MM:SS[.ffffff]` in the engine's local time
pub fn parse_timestamp(line: &str) -> Option<DateTime<Local>> {
    let raw = TIMESTAMP_PATTERN.captures(line)?.get(1)?.as_str();
    let naive = NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S%.f").ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Read the whole access log and collect every observation in it
pub async fn read_observations(path: &Path) -> Result<Vec<Observation>> {
    let to_error = |source: std::io::Error| CoreError::LogRead {
        path: path.to_path_buf(),
        source,
    };

    let file = tokio::fs::File::open(path).await.map_err(to_error)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut observations = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await.map_err(to_error)? == 0 {
            break;
        }
        // Undecodable bytes only spoil their own line
        if let Some(observation) = parse_line(&String::from_utf8_lossy(&buf)) {
            observations.push(observation);
        }
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_ipv4_line() {
        let line = "2024/01/15 12:00:00.123456 from tcp:203.0.113.5:41000 accepted tcp:example.com:443 [in-443 -> direct] email: alice@example.com";
        let obs = parse_line(line).unwrap();

        assert_eq!(obs.client, "alice@example.com");
        assert_eq!(obs.ip, "203.0.113.5");
        let seen = obs.seen_at.unwrap();
        assert_eq!((seen.year(), seen.month(), seen.day()), (2024, 1, 15));
        assert_eq!((seen.hour(), seen.minute()), (12, 0));
    }

    #[test]
    fn test_parse_bracketed_ipv6_and_udp() {
        let line = "2024/01/15 12:00:01 from udp:[2001:db8::1]:5353 accepted udp:1.1.1.1:53 email: bob@example.com";
        let obs = parse_line(line).unwrap();
        assert_eq!(obs.ip, "2001:db8::1");
        assert_eq!(obs.client, "bob@example.com");

        let bare = "from 198.51.100.9:1234 accepted tcp:x:443 email: carol";
        let obs = parse_line(bare).unwrap();
        assert_eq!(obs.ip, "198.51.100.9");
        assert!(obs.seen_at.is_none());
    }

    #[test]
    fn test_loopback_excluded() {
        assert!(parse_line("from tcp:127.0.0.1:5000 accepted tcp:x:443 email: alice").is_none());
        assert!(parse_line("from tcp:[::1]:5000 accepted tcp:x:443 email: alice").is_none());
    }

    #[test]
    fn test_incomplete_lines_skipped() {
        assert!(parse_line("from tcp:203.0.113.5:41000 accepted tcp:x:443 [in -> out]").is_none());
        assert!(parse_line("2024/01/15 12:00:00 [Info] email: alice@example.com").is_none());
        assert!(parse_line("from tcp:...:41000 accepted email: alice").is_none());
        assert!(parse_line("").is_none());
    }

    #[tokio::test]
    async fn test_read_observations() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("access.log");
        std::fs::write(
            &path,
            "from tcp:203.0.113.5:1 accepted x email: alice\nnoise\nfrom tcp:127.0.0.1:1 accepted x email: alice\nfrom 198.51.100.9:2 accepted x email: bob\n",
        )
        .unwrap();

        let observations = read_observations(&path).await.unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[1].client, "bob");

        let missing = read_observations(&tmp.path().join("missing.log")).await;
        assert!(matches!(missing, Err(CoreError::LogRead { .. })));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("access.log");
        let mut body = b"from tcp:203.0.113.5:1 accepted x email: alice\n".to_vec();
        body.extend_from_slice(b"garbage \xff\xfe line\n");
        body.extend_from_slice(b"from 198.51.100.9:2 accepted x email: bob");
        std::fs::write(&path, body).unwrap();

        let observations = read_observations(&path).await.unwrap();
        let clients: Vec<&str> = observations.iter().map(|o| o.client.as_str()).collect();
        assert_eq!(clients, vec!["alice", "bob"]);
    }
}
