//! TCP connection helpers shared by the command and live channels.

use std::time::Duration;

use tokio::net::TcpStream;

use lsctl_core::error::{Error, Result};

/// Default connection timeout (5 seconds).
///
/// Long enough for a control computer on the same LAN segment, short enough
/// that an unreachable instrument is reported promptly.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a TCP connection with a deadline.
///
/// Nagle's algorithm is disabled: command frames are small and
/// latency-sensitive.
pub async fn connect_stream(addr: &str, timeout: Duration) -> Result<TcpStream> {
    tracing::debug!(
        addr = %addr,
        timeout_ms = timeout.as_millis(),
        "Connecting to TCP endpoint"
    );

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            tracing::error!(addr = %addr, "TCP connection timed out");
            Error::Connection(format!("connect to {addr} timed out"))
        })?
        .map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "TCP connection failed");
            map_connect_error(e, addr)
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(
            addr = %addr,
            error = %e,
            "Failed to set TCP_NODELAY (continuing anyway)"
        );
    }

    tracing::debug!(addr = %addr, "TCP connection established");
    Ok(stream)
}

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
pub(crate) fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Connection(format!("connection refused: {addr}"))
        }
        _ => Error::Connection(format!("{addr}: {e}")),
    }
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
pub(crate) fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => Error::Connection(format!("connection lost: {e}")),
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_stream(&addr, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        match &err {
            Error::Connection(msg) => assert!(
                msg.contains("connection refused"),
                "expected 'connection refused' in message, got: {}",
                msg
            ),
            other => panic!("expected Connection error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_timeout_to_nonexistent_host() {
        // RFC 5737 TEST-NET-1 is black-holed on most networks.
        let result = connect_stream("192.0.2.1:12345", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn connect_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = connect_stream(&addr, DEFAULT_CONNECT_TIMEOUT).await.unwrap();
        assert!(stream.nodelay().unwrap());
        server.await.unwrap();
    }

    #[test]
    fn io_errors_on_data_path_are_connection_errors() {
        let e = map_io_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(e, Error::Connection(_)));
        let e = map_io_error(std::io::Error::new(std::io::ErrorKind::Other, "other"));
        assert!(matches!(e, Error::Io(_)));
    }
}
