//! Port range parsing for reserved-port specifications.
//!
//! Accepts comma separated single ports and inclusive ranges, e.g.
//! `"22,80,8000-8100"`. Whitespace around entries is ignored.

use thiserror::Error;

/// Highest port number accepted anywhere in the configuration.
pub const MAX_VALID_PORT: i32 = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("invalid port {0:?}")]
    NotANumber(String),

    #[error("invalid range {0:?}")]
    Malformed(String),

    #[error("invalid range: ending value ({end}) less than starting ({start}) value")]
    Reversed { start: u32, end: u32 },

    #[error("port must be < {MAX_VALID_PORT} but found {0}")]
    OutOfRange(u32),
}

/// Expands a port specification into a sorted, deduplicated port list.
pub fn parse_port_ranges(spec: &str) -> Result<Vec<u32>, PortRangeError> {
    let mut ports = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.split_once('-') {
            None => ports.push(parse_port(part)?),
            Some((start, end)) => {
                if start.trim().is_empty() || end.trim().is_empty() || end.contains('-') {
                    return Err(PortRangeError::Malformed(part.to_string()));
                }
                let start = parse_port(start.trim())?;
                let end = parse_port(end.trim())?;
                if end < start {
                    return Err(PortRangeError::Reversed { start, end });
                }
                ports.extend(start..=end);
            }
        }
    }

    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

fn parse_port(raw: &str) -> Result<u32, PortRangeError> {
    let port: u32 = raw
        .parse()
        .map_err(|_| PortRangeError::NotANumber(raw.to_string()))?;
    if port > MAX_VALID_PORT as u32 {
        return Err(PortRangeError::OutOfRange(port));
    }
    Ok(port)
}
