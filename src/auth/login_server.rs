//! Loopback HTTP plumbing for the browser login flow.
//!
//! This is deliberately not a web framework: the listener is alive only for
//! the duration of one interactive login, serves a bundled static page, and
//! handles exactly one request at a time in the calling task.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{LinkError, Result};

/// Upper bound on the request head (request line + headers).
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Upper bound on the request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A parsed loopback HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Read one HTTP/1.1 request off the stream, bounded in size.
pub async fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(LinkError::Protocol("connection closed mid-request".into()));
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_header_end(&head) {
            break pos;
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(LinkError::Protocol("request head too large".into()));
        }
    };

    let head_text = String::from_utf8_lossy(&head[..header_end]).into_owned();
    let mut lines = head_text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| LinkError::Protocol("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| LinkError::Protocol("missing method".into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| LinkError::Protocol("missing path".into()))?
        .to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(LinkError::Protocol("request body too large".into()));
    }

    let mut body = head[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(LinkError::Protocol("connection closed mid-body".into()));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest { method, path, body })
}

/// Write a minimal HTTP/1.1 response and close the connection.
pub async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reason_phrase(status),
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Look up a bundled login-page asset by request path.
///
/// `/` maps to `/index.html`. Assets are compiled in and resolved by exact
/// table match, so no path can escape the bundle.
pub fn asset(path: &str) -> Option<(&'static str, &'static [u8])> {
    let path = if path == "/" { "/index.html" } else { path };
    match path {
        "/index.html" => Some(("text/html", include_str!("public/index.html").as_bytes())),
        "/style.css" => Some(("text/css", include_str!("public/style.css").as_bytes())),
        _ => None,
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}
