//! Wire codec: JSON bodies, optionally gzip-compressed.

use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use opamp_core::{AgentToServer, ServerToAgent, TransportError};
use serde::{Serialize, de::DeserializeOwned};

/// Content type of every body.
pub const CONTENT_TYPE: &str = "application/json";

/// Content encoding declared for compressed bodies.
pub const GZIP_ENCODING: &str = "gzip";

/// Serialize a report, compressing it when asked.
///
/// # Errors
/// Returns error if serialization or compression fails.
pub fn encode_report(report: &AgentToServer, compress: bool) -> Result<Vec<u8>, TransportError> {
    encode(report, compress)
}

/// Parse a report body. Used by servers and tests.
///
/// # Errors
/// Returns error if decompression or parsing fails.
pub fn decode_report(body: &[u8], compressed: bool) -> Result<AgentToServer, TransportError> {
    decode(body, compressed)
}

/// Serialize an instruction. Used by servers and tests.
///
/// # Errors
/// Returns error if serialization or compression fails.
pub fn encode_instruction(
    instruction: &ServerToAgent,
    compress: bool,
) -> Result<Vec<u8>, TransportError> {
    encode(instruction, compress)
}

/// Parse a response body. An empty body carries no instruction.
///
/// # Errors
/// Returns error if decompression or parsing fails.
pub fn decode_instruction(
    body: &[u8],
    compressed: bool,
) -> Result<Option<ServerToAgent>, TransportError> {
    if body.is_empty() {
        return Ok(None);
    }
    decode(body, compressed).map(Some)
}

fn encode<T: Serialize>(value: &T, compress: bool) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(value).map_err(TransportError::Encode)?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decode<T: DeserializeOwned>(body: &[u8], compressed: bool) -> Result<T, TransportError> {
    if compressed {
        let mut json = Vec::new();
        GzDecoder::new(body).read_to_end(&mut json)?;
        serde_json::from_slice(&json).map_err(TransportError::Decode)
    } else {
        serde_json::from_slice(body).map_err(TransportError::Decode)
    }
}
