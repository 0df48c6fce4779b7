//! TCP channel with length-delimited framing

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::Channel;
use crate::error::TransportError;

/// Largest accepted frame (64 MiB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Framed TCP connection to one peer
pub struct SocketChannel {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: Option<SocketAddr>,
}

impl SocketChannel {
    /// Wrap an accepted or connected stream
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            peer,
        }
    }

    /// Connect to a listening broker
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait]
impl Channel for SocketChannel {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.framed.send(frame).await.map_err(TransportError::from)
    }

    async fn receive(&mut self) -> Result<Bytes, TransportError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>, TransportError> {
        // Partial frames stay buffered inside the codec between polls.
        match self.framed.next().now_or_never() {
            None => Ok(None),
            Some(Some(Ok(frame))) => Ok(Some(frame.freeze())),
            Some(Some(Err(e))) => Err(e.into()),
            Some(None) => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            tracing::debug!(error = %e, "Error closing socket channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (SocketChannel, SocketChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(SocketChannel::connect(addr), listener.accept());
        let (stream, _) = accepted.unwrap();
        (SocketChannel::new(stream), client.unwrap())
    }

    #[tokio::test]
    async fn test_frame_boundaries_preserved() {
        let (mut broker, mut worker) = connected_pair().await;
        broker.send(Bytes::from_static(b"first")).await.unwrap();
        broker.send(Bytes::from_static(b"")).await.unwrap();
        broker.send(Bytes::from(vec![7u8; 100_000])).await.unwrap();

        assert_eq!(worker.receive().await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(worker.receive().await.unwrap(), Bytes::new());
        assert_eq!(worker.receive().await.unwrap().len(), 100_000);
    }

    #[tokio::test]
    async fn test_try_receive_without_data() {
        let (mut broker, _worker) = connected_pair().await;
        assert_eq!(broker.try_receive().unwrap(), None);
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_as_closed() {
        let (mut broker, mut worker) = connected_pair().await;
        worker.close().await;
        drop(worker);

        assert_eq!(broker.receive().await, Err(TransportError::Closed));
    }
}
