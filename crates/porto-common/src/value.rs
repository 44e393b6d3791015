//! Parsing and formatting of property values.
//!
//! Sizes accept binary suffixes the way the API has always spelled them:
//! "32M" is 32 MiB, "1G" is 1 GiB; "Ki"/"Mi"/"Gi"/"Ti" are accepted as
//! synonyms. A plain number is bytes.

use crate::error::{PortoError, PortoResult};

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;
const TB: u64 = 1 << 40;

/// Parse a size value in bytes.
pub fn parse_size(s: &str) -> PortoResult<u64> {
    let s = s.trim();
    let suffixes = [
        ("Ki", KB),
        ("Mi", MB),
        ("Gi", GB),
        ("Ti", TB),
        ("K", KB),
        ("M", MB),
        ("G", GB),
        ("T", TB),
        ("k", KB),
        ("m", MB),
        ("g", GB),
        ("t", TB),
    ];

    for (suffix, multiplier) in suffixes {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.trim().parse().map_err(|_| PortoError::InvalidValue {
                message: format!("invalid size: {s}"),
            })?;
            return value
                .checked_mul(multiplier)
                .ok_or_else(|| PortoError::InvalidValue {
                    message: format!("size overflow: {s}"),
                });
        }
    }

    s.parse().map_err(|_| PortoError::InvalidValue {
        message: format!("invalid size: {s}"),
    })
}

/// Format a byte count with the largest exact binary suffix.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    if bytes >= GB && bytes % GB == 0 {
        format!("{}G", bytes / GB)
    } else if bytes >= MB && bytes % MB == 0 {
        format!("{}M", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}K", bytes / KB)
    } else {
        bytes.to_string()
    }
}

/// Parse a boolean property value.
pub fn parse_bool(s: &str) -> PortoResult<bool> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(PortoError::InvalidValue {
            message: format!("invalid boolean: {s}"),
        }),
    }
}

/// Format a boolean property value.
#[must_use]
pub fn format_bool(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

/// Parse a signed integer, used by properties where -1 means unlimited.
pub fn parse_i64(s: &str) -> PortoResult<i64> {
    s.trim().parse().map_err(|_| PortoError::InvalidValue {
        message: format!("invalid integer: {s}"),
    })
}

/// Parse an unsigned integer.
pub fn parse_u64(s: &str) -> PortoResult<u64> {
    s.trim().parse().map_err(|_| PortoError::InvalidValue {
        message: format!("invalid integer: {s}"),
    })
}

/// Split an `env`-style list `A=a;B=b` into pairs.
pub fn parse_env_list(s: &str) -> PortoResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    for item in s.split(';').filter(|i| !i.is_empty()) {
        let (key, val) = item.split_once('=').ok_or_else(|| PortoError::InvalidValue {
            message: format!("environment entry without '=': {item}"),
        })?;
        out.push((key.to_string(), val.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_binary() {
        assert_eq!(parse_size("32M").unwrap(), 32 * MB);
        assert_eq!(parse_size("1G").unwrap(), GB);
        assert_eq!(parse_size("2Gi").unwrap(), 2 * GB);
        assert_eq!(parse_size("512k").unwrap(), 512 * KB);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert!(parse_size("1x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn size_roundtrip() {
        assert_eq!(format_size(32 * MB), "32M");
        assert_eq!(format_size(GB), "1G");
        assert_eq!(format_size(1500), "1500");
        assert_eq!(parse_size(&format_size(48 * KB)).unwrap(), 48 * KB);
    }

    #[test]
    fn bools() {
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(parse_bool("yes").is_err());
        assert_eq!(format_bool(true), "true");
    }

    #[test]
    fn env_lists() {
        let env = parse_env_list("PATH=/bin;HOME=/root").unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0], ("PATH".to_string(), "/bin".to_string()));
        assert!(parse_env_list("BROKEN").is_err());
        assert!(parse_env_list("").unwrap().is_empty());
    }
}
