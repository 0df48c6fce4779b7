//! Transport channels between the broker and a single worker
//!
//! A channel carries opaque frames in both directions and preserves message
//! boundaries and order. Two implementations are provided:
//! - [`MemoryChannel`] - a pair of in-process queues (local-thread workers)
//! - [`SocketChannel`] - length-delimited frames over TCP (process workers)

mod memory;
mod socket;

pub use memory::MemoryChannel;
pub use socket::{SocketChannel, MAX_FRAME_LENGTH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;
use crate::protocol::{decode, encode};

/// Bidirectional framed message channel
#[async_trait]
pub trait Channel: Send + 'static {
    /// Send one frame
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Wait for the next frame
    async fn receive(&mut self) -> Result<Bytes, TransportError>;

    /// Return the next frame if one is already buffered
    fn try_receive(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the channel; the peer observes `TransportError::Closed`
    async fn close(&mut self);
}

/// Encode and send a message
pub async fn send_message<C, T>(channel: &mut C, message: &T) -> Result<(), TransportError>
where
    C: Channel + ?Sized,
    T: Serialize + Sync,
{
    let frame = encode(message)?;
    channel.send(frame).await
}

/// Receive and decode a message
pub async fn receive_message<C, T>(channel: &mut C) -> Result<T, TransportError>
where
    C: Channel + ?Sized,
    T: DeserializeOwned,
{
    let frame = channel.receive().await?;
    decode(&frame)
}
