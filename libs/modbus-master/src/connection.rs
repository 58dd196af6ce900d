//! Modbus TCP connection
//!
//! Owns one `TcpStream`. Received bytes accumulate in a buffer until a full
//! MBAP frame is present, so a read abandoned by a timeout loses nothing.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::constants::{MAX_FRAME_LEN, MBAP_HEADER_LEN};
use crate::error::TransportError;
use crate::frame::{Frame, MbapPrefix};

/// Established TCP connection to one Modbus server
#[derive(Debug)]
pub struct ModbusConnection {
    stream: TcpStream,
    endpoint: String,
    rx: Vec<u8>,
}

impl ModbusConnection {
    /// Create a TCP connection
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        timeout_duration: Duration,
    ) -> Result<Self, TransportError> {
        let endpoint = format!("{host}:{port}");
        debug!("TCP connecting: {}", endpoint);

        match timeout(timeout_duration, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }

                info!("TCP connected: {}", endpoint);
                Ok(Self {
                    stream,
                    endpoint,
                    rx: Vec::with_capacity(MAX_FRAME_LEN),
                })
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", endpoint, e);
                Err(TransportError::Connect {
                    endpoint,
                    reason: e.to_string(),
                })
            },
            Err(_) => {
                warn!("TCP timeout: {}", endpoint);
                Err(TransportError::Connect {
                    reason: format!("timed out after {}ms", timeout_duration.as_millis()),
                    endpoint,
                })
            },
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one encoded frame
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await.map_err(|e| {
            error!("TCP TX: {}", e);
            TransportError::Io(format!("TCP send error: {e}"))
        })?;
        debug!("TCP TX: {}B", data.len());
        Ok(())
    }

    /// Receive the next complete frame
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn receive_frame(&mut self) -> Result<Frame, TransportError> {
        let mut chunk = [0u8; MAX_FRAME_LEN];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }

            let n = self.stream.read(&mut chunk).await.map_err(|e| {
                error!("TCP RX: {}", e);
                TransportError::Io(format!("TCP read error: {e}"))
            })?;
            if n == 0 {
                warn!("TCP closed by peer: {}", self.endpoint);
                return Err(TransportError::Io("Connection closed by peer".to_string()));
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    // Split one frame off the front of the receive buffer
    fn take_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.rx.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; MBAP_HEADER_LEN];
        prefix.copy_from_slice(&self.rx[..MBAP_HEADER_LEN]);
        let header = MbapPrefix::parse(&prefix).inspect_err(|e| {
            error!("TCP invalid header: {}", e);
        })?;

        let total = MBAP_HEADER_LEN + header.length as usize;
        if self.rx.len() < total {
            return Ok(None);
        }

        let frame = Frame::from_parts(header, &self.rx[MBAP_HEADER_LEN..total]);
        self.rx.drain(..total);
        debug!("TCP RX: {}B", total);
        frame.map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (ModbusConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (conn, accepted) = tokio::join!(
            ModbusConnection::connect_tcp("127.0.0.1", port, Duration::from_secs(1)),
            listener.accept()
        );
        (conn.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_receive_frame_split_across_writes() {
        let (mut conn, mut server) = pair().await;

        server.write_all(&[0x00, 0x07, 0x00, 0x00]).await.unwrap();
        server.flush().await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            server
                .write_all(&[0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34])
                .await
                .unwrap();
            server
        });

        let frame = conn.receive_frame().await.unwrap();
        assert_eq!(frame.transaction_id, 7);
        assert_eq!(frame.unit_id, 1);
        assert_eq!(frame.pdu.as_slice(), &[0x03, 0x02, 0x12, 0x34]);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_receive_two_frames_in_one_write() {
        let (mut conn, mut server) = pair().await;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
        bytes.extend_from_slice(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x84, 0x01]);
        server.write_all(&bytes).await.unwrap();

        assert_eq!(conn.receive_frame().await.unwrap().transaction_id, 1);
        assert_eq!(conn.receive_frame().await.unwrap().transaction_id, 2);
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_length() {
        let (mut conn, mut server) = pair().await;

        server
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01])
            .await
            .unwrap();

        let err = conn.receive_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_peer_close_is_io_error() {
        let (mut conn, server) = pair().await;
        drop(server);

        let err = conn.receive_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ModbusConnection::connect_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
