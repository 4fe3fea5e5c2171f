//! Startup parameters sent host → remote, applied exactly once.
//!
//! The wire image is a fixed 264-byte struct: `log_mode: i32`,
//! `debug_string_set: i32`, `debug_string: [u8; 256]`. The debug string is a
//! tracing env-filter directive the remote applies to its own subscriber.

use crate::constants::DEBUG_STRING_LEN;
use crate::error::{Error, Result};
use bytes::Bytes;

/// How the remote half handles its log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Keep logs local to the remote process
    #[default]
    Local = 0,
    /// Buffer logs and ship them to the host at teardown
    Buffered = 1,
    /// Ship each log line to the host as it is produced
    Immediate = 2,
}

impl LogMode {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(LogMode::Local),
            1 => Some(LogMode::Buffered),
            2 => Some(LogMode::Immediate),
            _ => None,
        }
    }
}

/// Instance startup configuration, sent once during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceParams {
    /// Log handling mode for the remote half
    pub log_mode: LogMode,
    /// Optional debug-verbosity directive (a tracing env-filter string)
    pub debug_string: Option<String>,
}

impl InstanceParams {
    /// Fixed wire size: two i32 fields plus the debug-string field.
    pub const WIRE_SIZE: usize = 8 + DEBUG_STRING_LEN;

    /// Serialize to the fixed wire image.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut raw = Vec::with_capacity(Self::WIRE_SIZE);
        raw.extend_from_slice(&(self.log_mode as i32).to_le_bytes());
        match &self.debug_string {
            Some(value) => {
                if value.len() >= DEBUG_STRING_LEN {
                    return Err(Error::Serialization(format!(
                        "debug string is {} bytes; the field holds at most {}",
                        value.len(),
                        DEBUG_STRING_LEN - 1
                    )));
                }
                raw.extend_from_slice(&1i32.to_le_bytes());
                raw.extend_from_slice(value.as_bytes());
                raw.extend(std::iter::repeat(0u8).take(DEBUG_STRING_LEN - value.len()));
            }
            None => {
                raw.extend_from_slice(&0i32.to_le_bytes());
                raw.extend(std::iter::repeat(0u8).take(DEBUG_STRING_LEN));
            }
        }
        Ok(Bytes::from(raw))
    }

    /// Parse the fixed wire image.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::WIRE_SIZE {
            return Err(Error::Serialization(format!(
                "instance params are {} bytes on the wire, got {}",
                Self::WIRE_SIZE,
                raw.len()
            )));
        }
        let log_mode_code = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let log_mode = LogMode::from_code(log_mode_code).ok_or_else(|| {
            Error::Serialization(format!("unknown log mode {}", log_mode_code))
        })?;
        let set = i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let debug_string = if set != 0 {
            let field = &raw[8..];
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            Some(
                String::from_utf8(field[..end].to_vec())
                    .map_err(|e| Error::Serialization(format!("debug string is not UTF-8: {}", e)))?,
            )
        } else {
            None
        };
        Ok(Self {
            log_mode,
            debug_string,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_debug_string() {
        let params = InstanceParams {
            log_mode: LogMode::Immediate,
            debug_string: Some("dashlink=debug,warn".to_string()),
        };
        let raw = params.to_bytes().unwrap();
        assert_eq!(raw.len(), InstanceParams::WIRE_SIZE);
        assert_eq!(InstanceParams::from_bytes(&raw).unwrap(), params);
    }

    #[test]
    fn test_roundtrip_without_debug_string() {
        let params = InstanceParams::default();
        let raw = params.to_bytes().unwrap();
        assert_eq!(InstanceParams::from_bytes(&raw).unwrap(), params);
    }

    #[test]
    fn test_oversized_debug_string_rejected() {
        let params = InstanceParams {
            log_mode: LogMode::Local,
            debug_string: Some("x".repeat(DEBUG_STRING_LEN)),
        };
        assert!(params.to_bytes().is_err());
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(InstanceParams::from_bytes(&[0u8; 12]).is_err());
    }
}
