//! `Content-Length` framing for the worker's JSON-RPC channel.
//!
//! The worker speaks JSON-RPC 2.0 over stdio using the same framing as a
//! language server: a header block terminated by an empty line, then exactly
//! `Content-Length` bytes of JSON.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Project graphs can be large; anything past this is treated as a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Parse one header line.
///
/// Returns `Some(len)` for a `Content-Length` header, `None` for any other
/// header (e.g. `Content-Type`), which the worker may send and we ignore.
fn parse_header_line(line: &str) -> Result<Option<usize>> {
    let Some((key, value)) = line.split_once(':') else {
        bail!("malformed header line: {line:?}");
    };
    if !key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("invalid {CONTENT_LENGTH} value: {:?}", value.trim()))?;
    Ok(Some(len))
}

/// Reads framed JSON messages from the worker's stdout.
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

    /// Read the next frame.
    ///
    /// `Ok(None)` means the stream ended cleanly between frames. EOF in the
    /// middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(len) = self.read_content_length().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            bail!("frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        let value = serde_json::from_slice(&body).context("decoding frame body as JSON")?;
        Ok(Some(value))
    }

    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                if started {
                    bail!("stream ended inside a frame header");
                }
                return Ok(None);
            }
            started = true;

            let line = self.line.trim();
            if line.is_empty() {
                break;
            }
            if let Some(len) = parse_header_line(line)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .with_context(|| format!("frame header has no {CONTENT_LENGTH}"))
    }
}

/// Writes framed JSON messages to the worker's stdin.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding frame body")?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[test]
    fn header_line_parsing() {
        assert_eq!(parse_header_line("Content-Length: 42").unwrap(), Some(42));
        assert_eq!(parse_header_line("content-length:7").unwrap(), Some(7));
        assert_eq!(
            parse_header_line("Content-Type: application/vscode-jsonrpc").unwrap(),
            None
        );
        assert!(parse_header_line("Content-Length: lots").is_err());
        assert!(parse_header_line("no colon here").is_err());
    }

    #[tokio::test]
    async fn reads_consecutive_frames_written_by_writer() {
        let first = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null});
        let second = serde_json::json!({"jsonrpc": "2.0", "method": "workspace/refresh"});

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
    async fn extra_headers_are_ignored() {
        let body = r#"{"id":3}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = FrameReader::new(raw.as_bytes());
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame["id"], 3);
    }

    #[tokio::test]
    async fn content_length_counts_bytes_not_chars() {
        let body = r#"{"path":"/répertoire"}"#;
        let raw = framed(body);
        let mut reader = FrameReader::new(raw.as_slice());
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame["path"], "/répertoire");
    }

    #[tokio::test]
    async fn truncated_streams_are_errors() {
        let cases: [&[u8]; 4] = [
            b"Content-Length: 10\r\n",
            b"Content-Length: 100\r\n\r\n{}",
            b"Content-Type: text/plain\r\n\r\n{}",
            b"Content-Length: 3\r\n\r\nabc",
        ];
        for raw in cases {
            let mut reader = FrameReader::new(raw);
            assert!(
                reader.read_frame().await.is_err(),
                "expected error for {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(raw.as_bytes());
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }
}
