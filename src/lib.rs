//! Read 12V battery monitors over Bluetooth Low Energy.
//!
//! Tested with the BM6 family of clip-on battery monitors and their rebranded
//! variants. The monitor exposes a GATT service with a write and a notify
//! characteristic. On top of that there is a small command/response protocol
//! in which every frame is one AES-128 block, using a key baked into the firmware.
//!
//! The following data is streamed while connected:
//!
//! - Battery voltage (V)
//! - State of charge (%)
//! - Temperature (°C)
//!
//! The platform's Bluetooth stack is reached through the [`Radio`] trait. With
//! the `bluest` feature enabled, [`BluestRadio`] implements it for Windows,
//! macOS, iOS and Linux.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use battmon::{BatteryClient, MonitorConfig, MonitorEvent, Radio};
//! # async fn run(radio: Arc<dyn Radio>) -> battmon::Result<()> {
//!     let (client, mut events) = BatteryClient::new(radio, MonitorConfig::default());
//!     client.start_scan(Duration::from_secs(10)).await?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             MonitorEvent::DeviceFound(peer) if peer.is_candidate() => {
//!                 client.connect(&peer.address).await?;
//!             }
//!             MonitorEvent::Data(frame) => println!("{frame}"),
//!             _ => {}
//!         }
//!     }
//! #   Ok(())
//! # }
//! ```

mod battery_client;
#[cfg(feature = "bluest")]
mod bluest_radio;
pub mod capability;
pub mod cipher;
pub mod config;
pub mod discovery;
mod error;
mod events;
pub mod message;
pub mod protocol;
pub mod radio;
pub mod session;
mod telemetry;

pub use battery_client::BatteryClient;
#[cfg(feature = "bluest")]
pub use bluest_radio::BluestRadio;
pub use capability::{CapabilityProbe, DenialReason, Preconditions, RadioState};
pub use config::MonitorConfig;
pub use discovery::{MatchConfidence, PeerDevice, ScanSummary};
pub use error::{Error, Permission, Result, ScanFailure};
pub use events::{EventReceiver, MonitorEvent};
pub use protocol::ProtocolVariant;
pub use radio::{Advertisement, GattLink, LinkEvent, LinkEventSender, Radio, ScanStrategy};
pub use session::ConnectionState;
pub use telemetry::TelemetryFrame;
