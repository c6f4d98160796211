//! The seam between the protocol client and the platform's Bluetooth stack.
//!
//! The platform provides scanning, links and GATT operations; everything
//! above this module (discovery, session handling, decoding) is platform
//! independent and can be driven by a fake radio in tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::capability::CapabilityProbe;
use crate::error::{Result, ScanFailure};
use crate::protocol::GattProfile;

/// The two discovery strategies run side by side during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanStrategy {
    /// BLE advertisement scanning, low-latency, no filter
    Advertisement,
    /// Legacy inquiry, for platforms where advertisement scanning is unreliable
    Inquiry,
}

/// One raw scan callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    /// Service UUIDs advertised by the peer, if any
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// Unsolicited events from an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification {
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    /// The link dropped without being asked to
    Disconnected,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// A Bluetooth adapter.
#[async_trait]
pub trait Radio: CapabilityProbe {
    /// Start one discovery strategy. Callbacks arrive on the returned stream
    /// until [`Radio::stop_scan`] is called for the same strategy.
    async fn start_scan(
        &self,
        strategy: ScanStrategy,
    ) -> std::result::Result<AdvertisementStream, ScanFailure>;

    /// Stop a discovery strategy. Must be safe to call when it is not running.
    async fn stop_scan(&self, strategy: ScanStrategy);

    /// Open a link-layer connection. Notifications and link loss are reported on `events`.
    async fn open_link(&self, address: &str, events: LinkEventSender) -> Result<Arc<dyn GattLink>>;
}

/// An open connection to a peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Enumerate services and locate the profile's service and characteristics.
    async fn resolve(&self, profile: &GattProfile) -> Result<()>;

    /// Write to the profile's write characteristic.
    async fn write(&self, payload: &[u8]) -> Result<()>;

    /// Subscribe to the profile's notify characteristic.
    async fn arm_notifications(&self) -> Result<()>;

    /// Close the link. Always safe to call.
    async fn close(&self);
}
