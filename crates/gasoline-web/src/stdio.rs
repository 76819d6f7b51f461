//! Line-framed JSON-RPC over stdin/stdout.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::mcp::GasolineMcpHandler;
use crate::mcp::jsonrpc::JsonRpcResponse;

/// Longest accepted message line.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

enum Line {
    Message(Vec<u8>),
    TooLong(usize),
    Eof,
}

async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Line> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= MAX_LINE_BYTES {
        return Ok(Line::Message(buf));
    }
    // Discard the rest of the oversized line.
    let mut total = buf.len();
    loop {
        buf.clear();
        let n = (&mut *reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        total += n;
        if n == 0 || buf.last() == Some(&b'\n') {
            return Ok(Line::TooLong(total));
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Serves messages until EOF. Messages are handled one at a time, in order.
pub async fn serve<R, W>(
    handler: &GasolineMcpHandler,
    mut reader: R,
    mut writer: W,
) -> Result<(), String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = next_line(&mut reader)
            .await
            .map_err(|e| format!("read stdin: {e}"))?;
        let response = match line {
            Line::Eof => break,
            Line::TooLong(len) => {
                warn!(len, max = MAX_LINE_BYTES, "dropping oversized JSON-RPC line");
                Some(JsonRpcResponse::parse_error(format!(
                    "message exceeds {MAX_LINE_BYTES} bytes"
                )))
            }
            Line::Message(raw) => {
                if raw.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                handler.handle_message(&raw, None).await
            }
        };
        if let Some(response) = response {
            write_response(&mut writer, &response)
                .await
                .map_err(|e| format!("write stdout: {e}"))?;
        }
    }
    debug!("stdin closed");
    Ok(())
}

pub async fn run(handler: GasolineMcpHandler) -> Result<(), String> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(&handler, stdin, tokio::io::stdout()).await
}
