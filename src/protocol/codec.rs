//! Frame encode/decode over an async byte stream. Payload
//! bytes are the standard self-describing binary codec; callers decode
//! them into the concrete request/response struct the message type
//! implies.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::protocol::frame::{FrameHeader, MessageType, HEADER_LEN};

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(MessageType, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::decode(&header_buf)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    if header.payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((header.message_type, payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message_type: MessageType, payload: &[u8]) -> Result<()> {
    let header = FrameHeader::new(message_type, payload.len() as u32);
    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::PingRequest;
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_round_trips_over_a_stream() {
        let payload = encode_payload(&PingRequest::default()).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, MessageType::Ping, &payload).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let (message_type, read_payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(message_type, MessageType::Ping);
        let _: PingRequest = decode_payload(&read_payload).unwrap();
    }
}
