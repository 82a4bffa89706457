//! Wire format for cross-context invalidation
//!
//! Messages travel as newline-delimited JSON:
//! `{"op":"invalidateHierarchy","path":"/src","origin":"4242-1"}`

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default socket file name for the multi-process broadcaster
pub const SOCKET_NAME: &str = "remote-fs-cache.sock";

/// Invalidation command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOp {
    Invalidate,
    InvalidateHierarchy,
    Clear,
}

/// A replicated invalidation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub op: SyncOp,
    /// Absent for `clear`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Context that issued the command
    pub origin: String,
}

impl SyncMessage {
    pub fn invalidate(origin: &str, path: &str) -> Self {
        Self {
            op: SyncOp::Invalidate,
            path: Some(path.to_string()),
            origin: origin.to_string(),
        }
    }

    pub fn invalidate_hierarchy(origin: &str, path: &str) -> Self {
        Self {
            op: SyncOp::InvalidateHierarchy,
            path: Some(path.to_string()),
            origin: origin.to_string(),
        }
    }

    pub fn clear(origin: &str) -> Self {
        Self {
            op: SyncOp::Clear,
            path: None,
            origin: origin.to_string(),
        }
    }
}

/// Default socket location: the user's runtime directory, else the temp dir
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_NAME)
}

/// Parse a JSON message from bytes
pub fn parse_message(data: &[u8]) -> Result<SyncMessage, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a message to newline-terminated JSON bytes
pub fn serialize_message(message: &SyncMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hierarchy_message() {
        let json = r#"{"op":"invalidateHierarchy","path":"/src","origin":"1-1"}"#;
        let message = parse_message(json.as_bytes()).unwrap();
        assert_eq!(message.op, SyncOp::InvalidateHierarchy);
        assert_eq!(message.path.as_deref(), Some("/src"));
        assert_eq!(message.origin, "1-1");
    }

    #[test]
    fn test_parse_clear_without_path() {
        let message = parse_message(br#"{"op":"clear","origin":"x"}"#).unwrap();
        assert_eq!(message, SyncMessage::clear("x"));
    }

    #[test]
    fn test_serialize_is_newline_delimited() {
        let bytes = serialize_message(&SyncMessage::invalidate("o", "/a b")).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains(r#""op":"invalidate""#));
        assert!(!text.trim_end().contains('\n'));
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(parse_message(br#"{"op":"explode","origin":"x"}"#).is_err());
    }
}
