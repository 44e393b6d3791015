//! Wire framing and message types.
//!
//! Messages are varint-length-delimited JSON values. One request yields
//! one response; Wait may defer its response until a matching container
//! dies or the timeout fires.

use std::collections::BTreeMap;

use porto_common::varint::{decode_varint, encode_varint};
use porto_common::{PortoError, PortoResult};
use serde::{Deserialize, Serialize};

/// Every request the daemon accepts. Exactly one method per message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Create a container.
    Create {
        /// Container name.
        name: String,
    },
    /// Create a container tied to this client's lifetime.
    CreateWeak {
        /// Container name.
        name: String,
    },
    /// Destroy a container and its descendants.
    Destroy {
        /// Container name.
        name: String,
    },
    /// List visible containers.
    List {
        /// Optional wildcard mask.
        mask: Option<String>,
    },
    /// Read one property.
    GetProperty {
        /// Container name.
        name: String,
        /// Property name, optionally indexed.
        property: String,
    },
    /// Write one property.
    SetProperty {
        /// Container name.
        name: String,
        /// Property name, optionally indexed.
        property: String,
        /// New value.
        value: String,
    },
    /// Read one data value.
    GetData {
        /// Container name.
        name: String,
        /// Data name, optionally indexed.
        data: String,
    },
    /// Combined read over containers and variables.
    Get {
        /// Container names.
        names: Vec<String>,
        /// Property and data names.
        variables: Vec<String>,
    },
    /// Start a container.
    Start {
        /// Container name.
        name: String,
    },
    /// Stop a container.
    Stop {
        /// Container name.
        name: String,
        /// Grace period before SIGKILL.
        timeout_ms: Option<u64>,
    },
    /// Freeze a container subtree.
    Pause {
        /// Container name.
        name: String,
    },
    /// Thaw a container subtree.
    Resume {
        /// Container name.
        name: String,
    },
    /// Signal the root task.
    Kill {
        /// Container name.
        name: String,
        /// Signal number.
        sig: i32,
    },
    /// Wait for any of the named containers to die.
    Wait {
        /// Names and wildcard patterns.
        names: Vec<String>,
        /// Timeout; absent waits forever.
        timeout_ms: Option<u64>,
    },
    /// List settable properties.
    PropertyList,
    /// List readable data.
    DataList,
    /// Daemon version.
    Version,
    /// Translate a path between container roots.
    ConvertPath {
        /// Path to translate.
        path: String,
        /// Source container.
        source: String,
        /// Destination container.
        destination: String,
    },
    /// Move a process into a container.
    AttachProcess {
        /// Target container.
        name: String,
        /// Process id.
        pid: i32,
        /// Expected command name, guards against pid reuse.
        comm: String,
    },
    /// Find the container a process belongs to.
    LocateProcess {
        /// Process id.
        pid: i32,
        /// Expected command name.
        comm: String,
    },
    /// Create and build a volume.
    CreateVolume {
        /// Mount point; autogenerated when absent.
        path: Option<String>,
        /// Backend, limits, layers and the rest.
        properties: BTreeMap<String, String>,
    },
    /// Link a volume to a container.
    LinkVolume {
        /// Volume path.
        path: String,
        /// Container; defaults to the caller's.
        container: Option<String>,
    },
    /// Unlink a volume from a container.
    UnlinkVolume {
        /// Volume path.
        path: String,
        /// Container, `***` for all links.
        container: Option<String>,
        /// Roll the unlink back when destruction fails.
        strict: Option<bool>,
    },
    /// List volumes.
    ListVolumes {
        /// Filter by mount-point prefix.
        path: Option<String>,
        /// Filter by linked container.
        container: Option<String>,
    },
    /// Adjust a built volume's limits.
    TuneVolume {
        /// Volume path.
        path: String,
        /// Changed properties.
        properties: BTreeMap<String, String>,
    },
    /// Import a layer from a tarball.
    ImportLayer {
        /// Layer name.
        layer: String,
        /// Tarball path.
        tarball: String,
        /// Merge into an existing layer.
        merge: Option<bool>,
        /// Place override.
        place: Option<String>,
    },
    /// Export a layer as a tarball.
    ExportLayer {
        /// Layer name.
        layer: String,
        /// Destination tarball.
        tarball: String,
        /// Place override.
        place: Option<String>,
    },
    /// Remove a layer.
    RemoveLayer {
        /// Layer name.
        layer: String,
        /// Place override.
        place: Option<String>,
    },
    /// List layers.
    ListLayers {
        /// Place override.
        place: Option<String>,
    },
    /// Read a layer's private label.
    GetLayerPrivate {
        /// Layer name.
        layer: String,
        /// Place override.
        place: Option<String>,
    },
    /// Set a layer's private label.
    SetLayerPrivate {
        /// Layer name.
        layer: String,
        /// New label.
        private: String,
        /// Place override.
        place: Option<String>,
    },
    /// Import a storage from a tarball.
    ImportStorage {
        /// Storage name.
        name: String,
        /// Tarball path.
        tarball: String,
        /// Private label.
        private: Option<String>,
        /// Place override.
        place: Option<String>,
    },
    /// Export a storage as a tarball.
    ExportStorage {
        /// Storage name.
        name: String,
        /// Destination tarball.
        tarball: String,
        /// Place override.
        place: Option<String>,
    },
    /// Remove a storage.
    RemoveStorage {
        /// Storage name.
        name: String,
        /// Place override.
        place: Option<String>,
    },
    /// List storages.
    ListStorage {
        /// Place override.
        place: Option<String>,
    },
}

/// A response; `error == 0` means success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Error code from the stable taxonomy, 0 on success.
    pub error: u32,
    /// Originating errno, 0 if none.
    pub errno: i32,
    /// Human-readable error text, empty on success.
    pub error_msg: String,
    /// Request-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

impl Response {
    /// Successful response with a payload.
    #[must_use]
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            error: 0,
            errno: 0,
            error_msg: String::new(),
            value,
        }
    }

    /// Successful response without a payload.
    #[must_use]
    pub fn empty() -> Self {
        Self::ok(serde_json::Value::Null)
    }

    /// Response carrying an error.
    #[must_use]
    pub fn from_error(error: &PortoError) -> Self {
        Self {
            error: error.code(),
            errno: error.errno(),
            error_msg: error.to_string(),
            value: serde_json::Value::Null,
        }
    }
}

/// Frame a serializable message.
pub fn encode_frame<T: Serialize>(message: &T) -> PortoResult<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(body.len() + 5);
    encode_varint(body.len() as u32, &mut frame);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to decode one frame from the front of a buffer.
///
/// Returns the message and the bytes consumed, or `None` while the frame
/// is still incomplete. Frames longer than `max_len` are an error.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(
    buf: &[u8],
    max_len: usize,
) -> PortoResult<Option<(T, usize)>> {
    let Some((len, used)) = decode_varint(buf)? else {
        return Ok(None);
    };
    if len as usize > max_len {
        return Err(PortoError::InvalidValue {
            message: format!("message of {len} bytes exceeds the limit"),
        });
    }
    let Some(body) = buf[used..].get(..len as usize) else {
        return Ok(None);
    };
    let message = serde_json::from_slice(body)?;
    Ok(Some((message, used + len as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_roundtrip() {
        let request = Request::SetProperty {
            name: "a/b".to_string(),
            property: "memory_limit".to_string(),
            value: "32M".to_string(),
        };
        let frame = encode_frame(&request).unwrap();
        let (decoded, used): (Request, usize) = decode_frame(&frame, 1 << 20).unwrap().unwrap();
        assert_eq!(decoded, request);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let frame = encode_frame(&Request::Version).unwrap();
        for cut in 0..frame.len() {
            let result: Option<(Request, usize)> = decode_frame(&frame[..cut], 1 << 20).unwrap();
            assert!(result.is_none(), "cut at {cut} should be incomplete");
        }
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let request = Request::List { mask: None };
        let frame = encode_frame(&request).unwrap();
        assert!(decode_frame::<Request>(&frame, 4).is_err());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = encode_frame(&Request::Version).unwrap();
        buf.extend(encode_frame(&Request::PropertyList).unwrap());

        let (first, used): (Request, usize) = decode_frame(&buf, 1 << 20).unwrap().unwrap();
        assert_eq!(first, Request::Version);
        let (second, _): (Request, usize) = decode_frame(&buf[used..], 1 << 20).unwrap().unwrap();
        assert_eq!(second, Request::PropertyList);
    }

    #[test]
    fn error_response_carries_code() {
        let err = PortoError::ContainerDoesNotExist {
            name: "x".to_string(),
        };
        let response = Response::from_error(&err);
        assert_eq!(response.error, 4);
        assert!(response.error_msg.contains('x'));
    }
}
