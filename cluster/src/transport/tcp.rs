// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! TCP transport with length-delimited frames.
//!
//! Every node listens on its bound address and opens one outbound connection
//! per peer on first use. Frames only flow one way on a connection: answers
//! come back on the peer's own connection to our listener, addressed with
//! the `reply_to` field of the call.
//!
//! Connecting and writing a frame are bounded by the I/O timeout. A peer
//! that times out loses its connection and is reconnected on the next send.
//! Frames larger than [`MAX_FRAME_LENGTH`] are refused in both directions.
//!

use super::{Inbound, Transport, INBOUND_CAPACITY};
use crate::Error;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    select,
    sync::{mpsc, Mutex},
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};

use tracing::{debug, warn};

use std::{collections::HashMap, sync::Arc, time::Duration};

/// Largest frame accepted or sent.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

type FrameWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>>;

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    address: String,
    connections: Mutex<HashMap<String, FrameWriter>>,
    io_timeout: Duration,
    token: CancellationToken,
}

impl TcpTransport {
    /// Binds a listener on `address` and starts accepting peers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the address cannot be bound.
    pub async fn bind(address: &str) -> Result<(Self, Inbound), Error> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            Error::Transport(format!("Can not bind {}: {}", address, e))
        })?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?
            .to_string();
        debug!("TCP transport listening on {}.", local);

        let (sender, receiver) = mpsc::channel(INBOUND_CAPACITY);
        let token = CancellationToken::new();
        tokio::spawn(accept_loop(listener, sender, token.clone()));

        Ok((
            Self {
                address: local,
                connections: Mutex::new(HashMap::new()),
                io_timeout: IO_TIMEOUT,
                token,
            },
            receiver,
        ))
    }

    /// Bounds every connect and frame write. Defaults to 5 seconds.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    async fn connection(&self, address: &str) -> Result<FrameWriter, Error> {
        if let Some(writer) = self.connections.lock().await.get(address).cloned() {
            return Ok(writer);
        }

        let stream = timeout(self.io_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Transport(format!("Connecting to {} timed out", address)))?
            .map_err(|e| Error::Transport(format!("Can not connect to {}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        let (_, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(FramedWrite::new(write_half, codec())));

        let mut connections = self.connections.lock().await;
        Ok(connections
            .entry(address.to_owned())
            .or_insert(writer)
            .clone())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn send(&self, address: &str, frame: Vec<u8>) -> Result<(), Error> {
        if frame.len() > MAX_FRAME_LENGTH {
            return Err(Error::Transport(format!(
                "Frame of {} bytes to {} is too large",
                frame.len(),
                address
            )));
        }
        let writer = self.connection(address).await?;
        let sent = timeout(self.io_timeout, async {
            writer.lock().await.send(Bytes::from(frame)).await
        })
        .await;
        let error = match sent {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("Can not send to {}: {}", address, e),
            Err(_) => format!("Sending to {} timed out", address),
        };
        // Reconnect on the next send.
        let mut connections = self.connections.lock().await;
        if connections
            .get(address)
            .is_some_and(|cached| Arc::ptr_eq(cached, &writer))
        {
            connections.remove(address);
        }
        Err(Error::Transport(error))
    }

    async fn close(&self) {
        debug!("Closing TCP transport {}.", self.address);
        self.token.cancel();
        self.connections.lock().await.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    sender: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
) {
    loop {
        select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}.", peer);
                    tokio::spawn(read_loop(stream, sender.clone(), token.clone()));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn read_loop(
    stream: TcpStream,
    sender: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, codec());
    loop {
        select! {
            _ = token.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => {
                    if sender.send(bytes.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Dropping connection after bad frame: {}", e);
                    break;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_tcp() {
        let (a, _inbound_a) = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let (b, mut inbound_b) = TcpTransport::bind("127.0.0.1:0").await.unwrap();

        a.send(&b.local_address(), b"first".to_vec()).await.unwrap();
        a.send(&b.local_address(), b"second".to_vec()).await.unwrap();

        assert_eq!(inbound_b.recv().await, Some(b"first".to_vec()));
        assert_eq!(inbound_b.recv().await, Some(b"second".to_vec()));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_peer_that_stops_reading_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        // Accepts and holds the connection without reading from it.
        let held = tokio::spawn(async move { listener.accept().await });

        let (a, _inbound) = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let a = a.with_io_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let mut result = Ok(());
        for _ in 0..8 {
            result = a.send(&address, vec![7; 8 * 1024 * 1024]).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(a.connections.lock().await.is_empty());

        held.abort();
        a.close().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        let (a, _inbound) = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let (b, _inbound_b) = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            a.send(&b.local_address(), vec![0; MAX_FRAME_LENGTH + 1]).await,
            Err(Error::Transport(_))
        ));
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (a, _inbound) = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let (b, _inbound_b) = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let gone = b.local_address();
        b.close().await;
        drop(b);
        // The listener task exits once cancelled, closing the socket.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            a.send(&gone, vec![1]).await,
            Err(Error::Transport(_))
        ));
    }
}
