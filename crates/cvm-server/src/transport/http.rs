//! Minimal HTTP/1.1 handling for requests that are not WebSocket upgrades.
//!
//! The request head is peeked, not consumed, so an upgrade request can be
//! handed to the WebSocket handshake untouched.

use cvm_core::CvmResult;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest request head we are willing to buffer.
pub const MAX_HEAD: usize = 8 * 1024;

/// Most header lines accepted in one request head.
const MAX_HEADERS: usize = 64;

/// Body served to plain GET requests.
pub const STATUS_BODY: &str = "CollabVM relay\n";

const PEEK_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Upgrade,
    Get,
    Head,
    Other,
}

/// Parse a buffered request head. `None` means more bytes are needed;
/// a malformed head classifies as [`RequestKind::Other`].
pub fn parse_head(buf: &[u8]) -> Option<RequestKind> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => Some(classify(&req)),
        Ok(httparse::Status::Partial) => None,
        Err(_) => Some(RequestKind::Other),
    }
}

/// Classify a fully parsed request.
fn classify(req: &httparse::Request<'_, '_>) -> RequestKind {
    let upgrade = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && std::str::from_utf8(h.value).is_ok_and(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("websocket"))
            })
    });
    match req.method {
        Some("GET") if upgrade => RequestKind::Upgrade,
        Some("GET") => RequestKind::Get,
        Some("HEAD") => RequestKind::Head,
        _ => RequestKind::Other,
    }
}

/// Wait until a full request head is buffered and classify it.
/// `None` means the peer closed or the head exceeded [`MAX_HEAD`].
pub async fn peek_request(stream: &TcpStream) -> CvmResult<Option<RequestKind>> {
    let mut buf = vec![0u8; MAX_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(kind) = parse_head(&buf[..n]) {
            return Ok(Some(kind));
        }
        if n == MAX_HEAD {
            return Ok(None);
        }
        tokio::time::sleep(PEEK_BACKOFF).await;
    }
}

/// Canned response for a non-upgrade request.
pub fn response(kind: RequestKind) -> Vec<u8> {
    match kind {
        RequestKind::Get => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            STATUS_BODY.len(),
            STATUS_BODY
        )
        .into_bytes(),
        RequestKind::Head => {
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
        }
        RequestKind::Upgrade | RequestKind::Other => {
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
        }
    }
}

/// Answer a non-upgrade request and close the connection.
pub async fn respond(mut stream: TcpStream, kind: RequestKind) -> CvmResult<()> {
    let mut discard = vec![0u8; MAX_HEAD];
    let _ = stream.read(&mut discard).await?;
    stream.write_all(&response(kind)).await?;
    stream.shutdown().await?;
    Ok(())
}
