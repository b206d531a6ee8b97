use crate::buffer_pool;
use crate::request::{self, ParseError};
use crate::session::new_session_id;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

/// Success response confirming the tunnel, verbatim
pub const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Response for a failed or empty DNS lookup, verbatim
pub const RESPONSE_DNS_FAILED: &[u8] = b"HTTP/1.1 502 DNS Lookup Failed\r\n\r\n";

/// Response for a failed upstream dial, verbatim
pub const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Error type for a tunnel session. Every variant is handled inside the
/// session itself; nothing propagates to the accept loop.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("DNS lookup failed for {0:?}")]
    Resolution(String),

    #[error("connection to {target:?} failed: {source}")]
    Dial {
        target: String,
        source: io::Error,
    },

    #[error("relay error: {0}")]
    Relay(#[source] io::Error),
}

/// Drive one accepted client connection to completion.
///
/// Owns the client socket for its whole lifetime and, after a successful
/// dial, the upstream socket too; both are closed exactly once on every exit
/// path. Never fails outward: errors are logged and tagged on the session
/// span, and at most one HTTP-style response is written back to the client
/// (only for resolution and dial failures).
pub async fn handle_client(stream: TcpStream, peer_addr: SocketAddr) {
    let span = info_span!(
        "proxy.request",
        session = %new_session_id(),
        peer = %peer_addr,
        target.hostport = field::Empty,
        target.hostname = field::Empty,
        target.ip = field::Empty,
        error = field::Empty,
    );

    async move {
        if let Err(err) = run_session(stream).await {
            Span::current().record("error", field::display(&err));
            match &err {
                // Policy: non-CONNECT and malformed traffic is dropped
                // silently, no 4xx/5xx is ever sent for it
                TunnelError::Parse(ParseError::NotConnect(line)) => {
                    info!(line = %line.trim_end(), "ignoring non-CONNECT request");
                }
                TunnelError::Parse(ParseError::Malformed(line)) => {
                    warn!(line = %line.trim_end(), "malformed request");
                }
                TunnelError::Parse(ParseError::Read(e)) => {
                    warn!(error = %e, "error reading request");
                }
                TunnelError::Resolution(host) => {
                    warn!(host = %host, "DNS lookup failed");
                }
                TunnelError::Dial { target, source } => {
                    warn!(target = %target.trim_end(), error = %source, "upstream connection failed");
                }
                TunnelError::Relay(e) => {
                    debug!(error = %e, "tunnel closed with error");
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn run_session(stream: TcpStream) -> Result<(), TunnelError> {
    let started = Instant::now();

    let (read_half, mut client_writer) = stream.into_split();
    let mut client_reader = BufReader::new(read_half);

    // Step 1: request line + header block. Parse failures never produce
    // response bytes; dropping the halves closes the connection.
    let tunnel_request = request::read_request(&mut client_reader).await?;

    let span = Span::current();
    span.record("target.hostport", field::display(&tunnel_request.host_port));
    span.record("target.hostname", field::display(&tunnel_request.host));
    info!(target = %tunnel_request.host_port.trim_end(), "CONNECT request");

    request::discard_headers(&mut client_reader).await;

    // Step 2: DNS lookup. The dial below re-resolves the target string on its
    // own; this lookup fails fast and records the resolved address.
    let resolved = resolve_host(&tunnel_request.host)
        .instrument(info_span!("dns.lookup", host = %tunnel_request.host))
        .await;
    match resolved {
        Ok(addr) => span.record("target.ip", field::display(addr.ip())),
        Err(_) => {
            let _ = client_writer.write_all(RESPONSE_DNS_FAILED).await;
            return Err(TunnelError::Resolution(tunnel_request.host));
        }
    };

    // Step 3: dial the target verbatim
    let dialed = TcpStream::connect(tunnel_request.host_port.as_str())
        .instrument(info_span!("dial.server", target = %tunnel_request.host_port.trim_end()))
        .await;
    let upstream = match dialed {
        Ok(upstream) => upstream,
        Err(source) => {
            let _ = client_writer.write_all(RESPONSE_BAD_GATEWAY).await;
            return Err(TunnelError::Dial {
                target: tunnel_request.host_port,
                source,
            });
        }
    };

    // Step 4: confirm the tunnel
    client_writer
        .write_all(RESPONSE_ESTABLISHED)
        .await
        .map_err(TunnelError::Relay)?;

    info!(
        target = %tunnel_request.host_port.trim_end(),
        elapsed = ?started.elapsed(),
        "tunnel established"
    );

    // Step 5: relay until either side closes
    let (bytes_up, bytes_down) = relay(client_reader, client_writer, upstream).await?;
    info!(bytes_up, bytes_down, "tunnel closed");

    Ok(())
}

/// Resolve a hostname to its first address.
///
/// An empty result set counts as failure, same as a lookup error.
async fn resolve_host(host: &str) -> io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, 0)).await?;
    addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
}

/// Copy bytes in both directions until either side reaches EOF or errors.
///
/// Client-side reads go through the request reader so that payload bytes
/// buffered during header consumption are forwarded ahead of fresh socket
/// reads. Both write halves are shut down on every exit path; a redundant
/// shutdown on an already closed socket is a no-op.
async fn relay(
    mut client_reader: BufReader<OwnedReadHalf>,
    mut client_writer: OwnedWriteHalf,
    upstream: TcpStream,
) -> Result<(u64, u64), TunnelError> {
    let (mut upstream_reader, mut upstream_writer) = upstream.into_split();

    let mut client_buf = buffer_pool::acquire().await;
    let mut upstream_buf = buffer_pool::acquire().await;

    let mut from_client = 0u64;
    let mut from_upstream = 0u64;
    let mut error: Option<io::Error> = None;

    loop {
        tokio::select! {
            res = client_reader.read(&mut client_buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = upstream_writer.write_all(&client_buf[..n]).await {
                        error = Some(e);
                        break;
                    }
                    from_client += n as u64;
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            },
            res = upstream_reader.read(&mut upstream_buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = client_writer.write_all(&upstream_buf[..n]).await {
                        error = Some(e);
                        break;
                    }
                    from_upstream += n as u64;
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            },
        }
    }

    shutdown_quietly(&mut upstream_writer, "upstream").await;
    shutdown_quietly(&mut client_writer, "client").await;

    buffer_pool::release(client_buf).await;
    buffer_pool::release(upstream_buf).await;

    match error {
        Some(e) => Err(TunnelError::Relay(e)),
        None => Ok((from_client, from_upstream)),
    }
}

/// Shut down one write half, swallowing the errors a normally closed peer
/// produces so that teardown stays idempotent.
async fn shutdown_quietly<W>(writer: &mut W, side: &str)
where
    W: AsyncWriteExt + Unpin,
{
    if let Err(e) = writer.shutdown().await {
        if e.kind() != io::ErrorKind::NotConnected && e.kind() != io::ErrorKind::BrokenPipe {
            debug!(side, error = %e, "shutdown error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn start_proxy() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer_addr)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_client(stream, peer_addr));
            }
        });
        addr
    }

    async fn connect_through(proxy: SocketAddr, request: &str) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        client
    }

    /// Reads everything the proxy sends until it closes the connection
    async fn read_until_close(client: &mut TcpStream) -> Vec<u8> {
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        received
    }

    #[tokio::test]
    async fn tunnel_relays_bytes_in_both_directions() {
        let proxy = start_proxy().await;

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        let upstream = tokio::spawn(async move {
            let (mut stream, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 10];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&[b'B'; 20]).await.unwrap();
            stream.shutdown().await.unwrap();
            buf
        });

        let mut client = connect_through(
            proxy,
            &format!("CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\nHost: x\r\n\r\n"),
        )
        .await;

        let mut response = [0u8; RESPONSE_ESTABLISHED.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, RESPONSE_ESTABLISHED);

        client.write_all(&[b'A'; 10]).await.unwrap();

        let mut down = [0u8; 20];
        client.read_exact(&mut down).await.unwrap();
        assert_eq!(down, [b'B'; 20]);

        let sent_upstream = upstream.await.unwrap();
        assert_eq!(sent_upstream, [b'A'; 10]);

        // Upstream closed, so the session ends and releases the client too
        let mut end = [0u8; 1];
        assert_eq!(client.read(&mut end).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buffered_payload_is_forwarded_to_upstream() {
        let proxy = start_proxy().await;

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        let upstream = tokio::spawn(async move {
            let (mut stream, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        // Headers and payload arrive in one segment; the payload bytes end up
        // in the request reader's buffer before the tunnel opens
        let mut client = connect_through(
            proxy,
            &format!("CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\nHost: x\r\n\r\nEARLY"),
        )
        .await;

        let mut response = [0u8; RESPONSE_ESTABLISHED.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, RESPONSE_ESTABLISHED);

        assert_eq!(&upstream.await.unwrap(), b"EARLY");
    }

    #[tokio::test]
    async fn non_connect_request_is_dropped_silently() {
        let proxy = start_proxy().await;
        let mut client = connect_through(proxy, "GET / HTTP/1.1\r\n\r\n").await;
        assert!(read_until_close(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn connect_without_target_is_dropped_silently() {
        let proxy = start_proxy().await;
        let mut client = connect_through(proxy, "CONNECT\r\n\r\n").await;
        assert!(read_until_close(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_host_gets_dns_failure_response() {
        let proxy = start_proxy().await;
        // A target without host:port syntax derives an empty host, which can
        // never resolve
        let mut client = connect_through(proxy, "CONNECT no-port-here HTTP/1.1\r\n\r\n").await;
        assert_eq!(read_until_close(&mut client).await, RESPONSE_DNS_FAILED);
    }

    #[tokio::test]
    async fn failed_dial_gets_bad_gateway_response() {
        let proxy = start_proxy().await;

        // Grab a port nothing is listening on; resolution of 127.0.0.1
        // succeeds, only the dial fails
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut client = connect_through(
            proxy,
            &format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(read_until_close(&mut client).await, RESPONSE_BAD_GATEWAY);
    }

    #[tokio::test]
    async fn redundant_shutdown_is_a_no_op() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(client);

        let (_read_half, mut write_half) = server.into_split();
        shutdown_quietly(&mut write_half, "test").await;
        // Simulates both relay directions closing the same handle
        shutdown_quietly(&mut write_half, "test").await;
    }

    #[tokio::test]
    async fn resolve_host_rejects_empty_host() {
        assert!(resolve_host("").await.is_err());
    }

    #[tokio::test]
    async fn resolve_host_accepts_ip_literal() {
        let addr = resolve_host("127.0.0.1").await.unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }
}
