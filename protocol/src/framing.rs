//! Length-prefixed frame boundary for the duplex Unix socket (§4.2).
//!
//! Frame payloads are opaque UTF-8 strings that may themselves contain
//! embedded newlines (a conversation checkpoint's delta text joins speaker
//! turns with `\n`, per §4.9) so the wire cannot use `\n` as the frame
//! delimiter. Each frame is instead prefixed with its length as a 4-byte
//! big-endian `u32`, the same shape the rest of the wire protocol already
//! reserves whole-number fields for.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;

/// Frames larger than this are rejected rather than trusted blindly off the
/// wire, since a corrupt or adversarial length prefix would otherwise drive
/// an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> std::io::Result<()> {
    let bytes = frame.as_bytes();
    let len = u32::try_from(bytes.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large to encode")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF between
/// frames (no bytes of a new length prefix have been read yet), matching the
/// `BufReader::lines()` contract this replaces.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>, CoreError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(CoreError::InternalZmqDecodeFailed),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CoreError::InternalZmqDecodeFailed);
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| CoreError::InternalZmqDecodeFailed)?;
    String::from_utf8(body).map(Some).map_err(|_| CoreError::InternalZmqDecodeFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame_with_embedded_newlines() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "c1|SAVE_SESSION|acct1|S1|user:hi\nagent:hello")
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, Some("c1|SAVE_SESSION|acct1|S1|user:hi\nagent:hello".to_string()));
    }

    #[tokio::test]
    async fn round_trips_two_consecutive_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "first").await.unwrap();
        write_frame(&mut buf, "second").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Some("first".to_string()));
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Some("second".to_string()));
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_a_frame_over_the_size_cap() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        buf.extend_from_slice(&vec![b'x'; 16]);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err, CoreError::InternalZmqDecodeFailed);
    }

    #[tokio::test]
    async fn clean_eof_between_frames_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }
}
