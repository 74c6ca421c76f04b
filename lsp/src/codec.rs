//! `Content-Length` framing for JSON-RPC over stdio.
//!
//! Each message is `Content-Length: N\r\n\r\n` followed by N bytes of JSON.
//! Header names are matched case-insensitively and unknown headers such as
//! `Content-Type` are skipped.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Next decoded message, or `None` on a clean EOF between messages.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(length) = self.read_header_block().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            bail!("{CONTENT_LENGTH} {length} exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading message body")?;
        let value = serde_json::from_slice(&body).context("decoding message body")?;
        Ok(Some(value))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if read == 0 {
                if started {
                    bail!("stream ended inside a header block");
                }
                return Ok(None);
            }
            started = true;

            let header = self.line.trim();
            if header.is_empty() {
                break;
            }
            let Some((name, value)) = header.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let parsed = value
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid {CONTENT_LENGTH} '{}'", value.trim()))?;
                length = Some(parsed);
            }
        }

        match length {
            Some(length) => Ok(Some(length)),
            None => bail!("header block without {CONTENT_LENGTH}"),
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode, frame and flush one message.
    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding message body")?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing message body")?;
        self.writer.flush().await.context("flushing message")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(bytes: &[u8]) -> Result<Option<serde_json::Value>> {
        FrameReader::new(bytes).read_frame().await
    }

    #[tokio::test]
    async fn consecutive_messages_decode_in_order() {
        let first = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        let second = serde_json::json!({"jsonrpc": "2.0", "method": "window/logMessage"});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&first).await.unwrap();
        writer.write_frame(&second).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(first));
        assert_eq!(reader.read_frame().await.unwrap(), Some(second));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive_and_extras_are_skipped() {
        let body = r#"{"id":7}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let value = read_one(frame.as_bytes()).await.unwrap().unwrap();
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn length_counts_bytes_not_chars() {
        let message = serde_json::json!({"layer": "top copper ü"});
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&message).await.unwrap();

        let body = serde_json::to_vec(&message).unwrap();
        assert!(buf.starts_with(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes()));
        assert_eq!(read_one(&buf).await.unwrap(), Some(message));
    }

    #[tokio::test]
    async fn malformed_streams_are_errors() {
        // No length header.
        assert!(read_one(b"Content-Type: x\r\n\r\n{}").await.is_err());
        // EOF inside the header block.
        assert!(read_one(b"Content-Length: 2\r\n").await.is_err());
        // Truncated body.
        assert!(read_one(b"Content-Length: 50\r\n\r\n{}").await.is_err());
        // Not a number.
        assert!(read_one(b"Content-Length: lots\r\n\r\n{}").await.is_err());
        // Not JSON.
        assert!(read_one(b"Content-Length: 4\r\n\r\nnope").await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading() {
        let frame = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        assert!(read_one(frame.as_bytes()).await.is_err());
    }
}
