use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Literal method prefix a tunnel request line must carry, single trailing
/// space included. Matching is case-sensitive.
const CONNECT_PREFIX: &str = "CONNECT ";

/// Error type for request parsing
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read request line: {0}")]
    Read(#[source] io::Error),

    #[error("non-CONNECT request: {0:?}")]
    NotConnect(String),

    #[error("malformed CONNECT line: {0:?}")]
    Malformed(String),
}

/// Parsed CONNECT request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Second token of the request line, verbatim. Usually "host:port"; no
    /// trimming is applied, so a version-less request line keeps its CRLF.
    pub host_port: String,
    /// Host part of `host_port`, derived best-effort; empty when the target
    /// does not split as host:port.
    pub host: String,
}

/// Read one CONNECT request line from the client stream.
///
/// Fails with [`ParseError::Read`] when the stream errors or closes before a
/// newline, [`ParseError::NotConnect`] for any other method, and
/// [`ParseError::Malformed`] when the line has fewer than two space-separated
/// tokens. None of these failures produce response bytes; the session drops
/// the connection silently.
pub async fn read_request<R>(reader: &mut R) -> Result<TunnelRequest, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    reader
        .read_until(b'\n', &mut raw)
        .await
        .map_err(ParseError::Read)?;

    if !raw.ends_with(b"\n") {
        return Err(ParseError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before request line",
        )));
    }

    let line = String::from_utf8_lossy(&raw).into_owned();

    if !line.starts_with(CONNECT_PREFIX) {
        return Err(ParseError::NotConnect(line));
    }

    let host_port = match line.split(' ').nth(1) {
        Some(token) => token.to_string(),
        None => return Err(ParseError::Malformed(line)),
    };

    let host = host_of(&host_port);

    Ok(TunnelRequest { host_port, host })
}

/// Read and discard header lines until the blank-line terminator.
///
/// Consumption ends at the first line that is exactly `\r\n`, or at the first
/// read error or EOF; none of those outcomes is reported. Payload bytes the
/// buffered reader has already pulled in stay buffered for the relay.
pub async fn discard_headers<R>(reader: &mut R)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if line == b"\r\n" || !line.ends_with(b"\n") {
                    break;
                }
            }
        }
    }
}

/// Best-effort host extraction from a host:port target string.
///
/// Follows standard host:port syntax, bracketed IPv6 literals included. Any
/// string that does not split cleanly yields an empty host rather than an
/// error; the target is still dialed verbatim later.
fn host_of(host_port: &str) -> String {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            if rest[end + 1..].starts_with(':') {
                return rest[..end].to_string();
            }
        }
        return String::new();
    }

    match host_port.rfind(':') {
        // An unbracketed colon in the host part means the split is ambiguous
        Some(idx) if !host_port[..idx].contains(':') => host_port[..idx].to_string(),
        _ => String::new(),
    }
}
