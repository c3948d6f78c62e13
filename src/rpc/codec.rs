use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rpc::Command;

/// One message on the wire. Responses carry the id of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    Request(Command),
    /// `Err` carries the remote error's message.
    Response(std::result::Result<(), String>),
}

impl Frame {
    pub fn request(id: u64, command: Command) -> Self {
        Self {
            id,
            body: FrameBody::Request(command),
        }
    }

    pub fn response(id: u64, result: std::result::Result<(), String>) -> Self {
        Self {
            id,
            body: FrameBody::Response(result),
        }
    }

    /// JSON payload for one length-delimited frame.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(buf: &BytesMut) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    #[test]
    fn response_carries_remote_error() {
        let frame = Frame::response(3, Err("no capacity".to_string()));
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&BytesMut::from(&bytes[..])).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.body, FrameBody::Response(Err("no capacity".to_string())));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = Frame::decode(&BytesMut::from(&b"not json"[..])).unwrap_err();
        assert!(matches!(err, QueueError::Codec(_)));
    }
}
