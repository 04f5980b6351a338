//! Byte-level framing shared by both channels.
//!
//! Commands are NUL-terminated frames of the form `command:payload`. Bulk payloads
//! (uploaded sources, container output) follow as a 4-byte big-endian length and the
//! raw bytes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

pub const STATUS_OK: &[u8] = b"ok\0";
pub const STATUS_ERR: &[u8] = b"error\0";
pub const STATUS_TYPE_ERR: &[u8] = b"typeErr\0";

pub const FRAME_DELIMITER: u8 = 0;

/// Reads one NUL-terminated frame, without the terminator.
///
/// A stream that ends before the terminator yields `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let read = reader.read_until(FRAME_DELIMITER, &mut frame).await?;
    if read == 0 || frame.last() != Some(&FRAME_DELIMITER) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream ended before frame delimiter",
        ));
    }
    frame.pop();
    Ok(frame)
}

pub async fn read_length<R>(reader: &mut R) -> std::io::Result<u32>
where
    R: AsyncRead + Unpin,
{
    reader.read_u32().await
}

/// Reads a length prefix followed by that many bytes.
pub async fn read_blob<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let length = read_length(reader).await? as usize;
    let mut blob = vec![0u8; length];
    reader.read_exact(&mut blob).await?;
    Ok(blob)
}

/// Splits a frame into its command and payload.
///
/// The command is everything before the first colon with leading slashes dropped; a
/// frame without a colon is a bare command with an empty payload.
pub fn split_command(frame: &[u8]) -> (String, Vec<u8>) {
    let (command, payload) = match frame.iter().position(|byte| *byte == b':') {
        Some(colon) => (&frame[..colon], frame[colon + 1..].to_vec()),
        None => (frame, Vec::new()),
    };
    let command = String::from_utf8_lossy(command);
    (command.trim_start_matches('/').to_string(), payload)
}

pub fn encode_length(length: usize) -> [u8; 4] {
    (length as u32).to_be_bytes()
}

/// `stopped:<id>:<code>\0`
pub fn stopped_frame(execution_id: &str, code: i64) -> Bytes {
    Bytes::from(format!("stopped:{}:{}\0", execution_id, code))
}

/// `data:<id>\0`
pub fn data_header(execution_id: &str) -> Bytes {
    Bytes::from(format!("data:{}\0", execution_id))
}

/// Length prefix followed by the payload.
pub fn length_prefixed(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// `data:<id>\0` followed by the length-prefixed payload, as one contiguous frame so
/// the pair can never be split by another frame or by an observer change.
pub fn data_frame(execution_id: &str, payload: &[u8]) -> Bytes {
    let header = data_header(execution_id);
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + 4);
    buf.put_slice(&header);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Appends the frame delimiter to an identifier.
pub fn terminated(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(FRAME_DELIMITER);
    out
}
