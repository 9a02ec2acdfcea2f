//! Boundary traits implemented by the host.
//!
//! The protocol core does not talk to a Bluetooth stack or a cloud account
//! itself. The host provides a [`Transport`] that can open a [`Link`] to the
//! lock, and a [`CredentialSource`] that knows the pairing secret and the
//! datapoint schema of a device.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::TransportError;
use crate::catalog::DeviceCredentials;

/// Event delivered by an established link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One notification chunk, in the order written by the peer.
    Chunk(Vec<u8>),
    /// The link dropped.
    Disconnected,
}

/// An established connection to one device.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Start notifications on [`CHARACTERISTIC_NOTIFY`](crate::core::CHARACTERISTIC_NOTIFY).
    ///
    /// Inbound chunks and the disconnect event are delivered on the returned
    /// channel. Dropping the receiver unsubscribes.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, TransportError>;

    /// Write one chunk to [`CHARACTERISTIC_WRITE`](crate::core::CHARACTERISTIC_WRITE) (without response).
    async fn write(&self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;

    /// Close the link.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Factory for links to one device.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Link type produced by this transport.
    type Link: Link;

    /// Establish a link to the device.
    async fn connect(&self) -> Result<Self::Link, TransportError>;
}

/// Source of device credentials and schema (cloud account, cache, file).
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// Look up the credentials of the device with the given address.
    async fn credentials(&self, address: &str) -> Option<DeviceCredentials>;
}
