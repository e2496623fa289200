//! HTTP/1.1 request framing and status-line parsing
//!
//! Only what the telemetry endpoint needs: one keep-alive POST per record
//! and the status code of whatever comes back.

/// Bytes of a response read per receive
pub const RESPONSE_BUFFER_LEN: usize = 1024;

/// Build a JSON POST for one record
pub fn build_request(path: &str, host: &str, body: &str) -> Vec<u8> {
    let head = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        path,
        host,
        body.len()
    );
    let mut request = Vec::with_capacity(head.len() + body.len());
    request.extend_from_slice(head.as_bytes());
    request.extend_from_slice(body.as_bytes());
    request
}

/// Parsed `HTTP/1.x CODE REASON` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Parse the status line at the start of a response
///
/// Returns `None` if the bytes do not start with an HTTP status line.
pub fn parse_status(response: &[u8]) -> Option<StatusLine> {
    let end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    let line = std::str::from_utf8(&response[..end]).ok()?;

    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").trim().to_string();
    Some(StatusLine { code, reason })
}
