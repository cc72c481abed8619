//! Block exchange wire messages
//!
//! One request and one response per stream. Each message is a JSON document
//! preceded by its length as an unsigned varint:
//!
//! ```text
//! request:  {"Cid":"bafk..."}
//! response: {"Data":"<base64>","Err":""}
//! ```
//!
//! A non-empty `Err` means the responder could not serve the block; `Data`
//! is then ignored.
//!
//! The field names follow the JSON exchange used by earlier p2pfs nodes, but
//! those sent bare newline-terminated documents with no length prefix. The
//! framing differs, so the two cannot talk to each other even though the
//! protocol id is the same.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest message body accepted off the wire (100 MiB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid length prefix: {0}")]
    Length(String),

    #[error("Message of {0} bytes exceeds the 100 MiB limit")]
    TooLarge(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    #[serde(rename = "Cid")]
    pub cid: String,
}

impl BlockRequest {
    pub fn new(cid: &cid::Cid) -> Self {
        Self {
            cid: cid.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    #[serde(rename = "Data", with = "base64_bytes", default)]
    pub data: Vec<u8>,

    #[serde(rename = "Err", default)]
    pub err: String,
}

impl BlockResponse {
    pub fn found(data: Vec<u8>) -> Self {
        Self {
            data,
            err: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            err: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.err.is_empty()
    }
}

/// Byte payloads travel as standard base64; `null` reads as empty
mod base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Write one length-prefixed message and flush
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), MessageError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(body.len()));
    }

    let mut buf = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(body.len(), &mut buf);

    writer.write_all(prefix).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, MessageError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = unsigned_varint::aio::read_usize(&mut *reader)
        .await
        .map_err(|e| MessageError::Length(e.to_string()))?;

    if len > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(len));
    }

    // Grow with what actually arrives rather than what the prefix claims
    let mut body = Vec::new();
    (&mut *reader).take(len as u64).read_to_end(&mut body).await?;
    if body.len() != len {
        return Err(MessageError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("message body ended after {} of {} bytes", body.len(), len),
        )));
    }
    Ok(serde_json::from_slice(&body)?)
}
