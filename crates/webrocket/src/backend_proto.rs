//! Line framing for the backend worker protocol.
//!
//! A message is a sequence of UTF-8 frames, one per line, closed by a single
//! empty line. The first frame of a request is the identity line, the second
//! a two-letter command, the rest command-specific payload. Replies use the
//! same framing with `OK`, `ER` or a command-specific frame first. Payloads
//! delivered to workers ride a `TR` frame followed by their JSON body.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame, in bytes.
const MAX_FRAME_LEN: usize = 64 * 1024;
/// Upper bound for frames per message.
const MAX_FRAMES: usize = 16;

/// Reads one framed message. Returns `None` on a clean end of stream; a
/// stream ending mid-message is an error.
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frames = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if frames.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            ));
        }
        let frame = line.trim_end_matches(['\r', '\n']);
        if frame.is_empty() {
            if frames.is_empty() {
                continue;
            }
            return Ok(Some(frames));
        }
        if frame.len() > MAX_FRAME_LEN || frames.len() >= MAX_FRAMES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized backend message",
            ));
        }
        frames.push(frame.to_string());
    }
}

/// Writes one framed message and flushes it.
pub async fn write_message<W>(writer: &mut W, frames: &[&str]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = String::new();
    for frame in frames {
        buf.push_str(frame);
        buf.push('\n');
    }
    buf.push('\n');
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await
}

/// A parsed one-shot backend request.
#[derive(Debug)]
pub struct BackendRequest {
    pub identity: String,
    pub command: String,
    pub payload: Vec<String>,
}

impl BackendRequest {
    pub fn from_frames(mut frames: Vec<String>) -> Option<Self> {
        if frames.len() < 2 {
            return None;
        }
        let payload = frames.split_off(2);
        let command = frames.pop()?;
        let identity = frames.pop()?;
        Some(Self {
            identity,
            command,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn round_trips_a_message() {
        let mut wire = Vec::new();
        write_message(&mut wire, &["id-line", "BC", "room", "hello", r#"{"x":1}"#])
            .await
            .unwrap();
        let mut reader = BufReader::new(wire.as_slice());
        let frames = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(frames, vec!["id-line", "BC", "room", "hello", r#"{"x":1}"#]);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_consecutive_messages() {
        let wire = b"RD\n\nHB\n\n".to_vec();
        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), vec!["RD"]);
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), vec!["HB"]);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let wire = b"id-line\nBC\n".to_vec();
        let mut reader = BufReader::new(wire.as_slice());
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn too_many_frames_is_an_error() {
        let mut wire = Vec::new();
        for _ in 0..32 {
            wire.extend_from_slice(b"frame\n");
        }
        wire.extend_from_slice(b"\n");
        let mut reader = BufReader::new(wire.as_slice());
        assert!(read_message(&mut reader).await.is_err());
    }

    #[test]
    fn splits_requests_into_identity_command_payload() {
        let req = BackendRequest::from_frames(vec![
            "id".into(),
            "OC".into(),
            "room".into(),
        ])
        .unwrap();
        assert_eq!(req.identity, "id");
        assert_eq!(req.command, "OC");
        assert_eq!(req.payload, vec!["room"]);
        assert!(BackendRequest::from_frames(vec!["id".into()]).is_none());
    }
}
