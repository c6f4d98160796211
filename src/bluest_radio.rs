//! [`Radio`] on top of the `bluest` cross-platform BLE library.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::capability::{CapabilityProbe, RadioState};
use crate::discovery::normalize_address;
use crate::error::{Error, Result, ScanFailure};
use crate::protocol::GattProfile;
use crate::radio::{
    Advertisement, AdvertisementStream, GattLink, LinkEvent, LinkEventSender, Radio, ScanStrategy,
};

type DeviceCache = Arc<Mutex<HashMap<String, Device>>>;

pub struct BluestRadio {
    adapter: Adapter,
    devices: DeviceCache,
    scans: Mutex<HashMap<ScanStrategy, JoinHandle<()>>>,
}

impl BluestRadio {
    /// Use the system's default adapter.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default().await.ok_or(Error::RadioUnavailable)?;
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            scans: Mutex::new(HashMap::new()),
        })
    }

    /// Wait until the adapter is powered on
    pub async fn wait_available(&self) -> Result<()> {
        self.adapter
            .wait_available()
            .await
            .map_err(|_| Error::RadioUnavailable)
    }

    fn remember(devices: &DeviceCache, address: &str, device: &Device) {
        if let Ok(mut devices) = devices.lock() {
            devices.insert(normalize_address(address), device.clone());
        }
    }
}

fn device_address(device: &Device) -> String {
    device.id().to_string()
}

fn advertisement(adv: &AdvertisingDevice) -> Advertisement {
    Advertisement {
        address: device_address(&adv.device),
        name: adv
            .adv_data
            .local_name
            .clone()
            .or_else(|| adv.device.name().ok()),
        services: adv.adv_data.services.clone(),
        rssi: adv.rssi,
    }
}

#[async_trait]
impl CapabilityProbe for BluestRadio {
    // Desktop stacks prompt for access on first use instead of exposing a permission model
    async fn radio_permission_granted(&self) -> bool {
        true
    }

    async fn location_permission_granted(&self) -> bool {
        true
    }

    async fn radio_state(&self) -> RadioState {
        match self.adapter.is_available().await {
            Ok(true) => RadioState::Enabled,
            Ok(false) => RadioState::Disabled,
            Err(err) => {
                warn!("Failed to query adapter state: {err}");
                RadioState::Unavailable
            }
        }
    }

    async fn location_service_enabled(&self) -> bool {
        true
    }
}

#[async_trait]
impl Radio for BluestRadio {
    async fn start_scan(
        &self,
        strategy: ScanStrategy,
    ) -> std::result::Result<AdvertisementStream, ScanFailure> {
        self.stop_scan(strategy).await;

        let (tx, rx) = mpsc::unbounded_channel::<Advertisement>();
        let (started, started_rx) = oneshot::channel::<std::result::Result<(), String>>();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();

        let task = match strategy {
            ScanStrategy::Advertisement => tokio::spawn(async move {
                let scan = match adapter.scan(&[]).await {
                    Ok(scan) => {
                        let _ = started.send(Ok(()));
                        scan
                    }
                    Err(err) => {
                        let _ = started.send(Err(err.to_string()));
                        return;
                    }
                };
                futures_util::pin_mut!(scan);
                while let Some(found) = scan.next().await {
                    let adv = advertisement(&found);
                    Self::remember(&devices, &adv.address, &found.device);
                    if tx.send(adv).is_err() {
                        break;
                    }
                }
            }),
            ScanStrategy::Inquiry => tokio::spawn(async move {
                let discovered = match adapter.discover_devices(&[]).await {
                    Ok(discovered) => {
                        let _ = started.send(Ok(()));
                        discovered
                    }
                    Err(err) => {
                        let _ = started.send(Err(err.to_string()));
                        return;
                    }
                };
                futures_util::pin_mut!(discovered);
                while let Some(found) = discovered.next().await {
                    let device = match found {
                        Ok(device) => device,
                        Err(err) => {
                            debug!("Inquiry error: {err}");
                            continue;
                        }
                    };
                    let adv = Advertisement {
                        address: device_address(&device),
                        name: device.name_async().await.ok(),
                        services: vec![],
                        rssi: None,
                    };
                    Self::remember(&devices, &adv.address, &device);
                    if tx.send(adv).is_err() {
                        break;
                    }
                }
            }),
        };

        match started_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("{strategy:?} scan failed to start: {err}");
                return Err(ScanFailure::Adapter);
            }
            Err(_) => return Err(ScanFailure::Adapter),
        }
        if let Ok(mut scans) = self.scans.lock() {
            scans.insert(strategy, task);
        }

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|adv| (adv, rx))
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self, strategy: ScanStrategy) {
        let task = self.scans.lock().ok().and_then(|mut scans| scans.remove(&strategy));
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn open_link(&self, address: &str, events: LinkEventSender) -> Result<Arc<dyn GattLink>> {
        let device = self
            .devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(&normalize_address(address)).cloned())
            .ok_or_else(|| Error::UnknownDevice(address.to_string()))?;

        self.adapter
            .connect_device(&device)
            .await
            .map_err(|err| Error::ConnectFailed(err.to_string()))?;

        Ok(Arc::new(BluestLink {
            adapter: self.adapter.clone(),
            device,
            events,
            endpoints: Mutex::new(None),
            pump: Mutex::new(None),
        }))
    }
}

#[derive(Clone)]
struct Endpoints {
    write: Characteristic,
    notify: Characteristic,
    notify_id: Uuid,
}

struct BluestLink {
    adapter: Adapter,
    device: Device,
    events: LinkEventSender,
    endpoints: Mutex<Option<Endpoints>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BluestLink {
    fn endpoints(&self) -> Option<Endpoints> {
        self.endpoints.lock().ok().and_then(|e| e.clone())
    }
}

#[async_trait]
impl GattLink for BluestLink {
    async fn resolve(&self, profile: &GattProfile) -> Result<()> {
        let service = self
            .device
            .discover_services_with_uuid(profile.service)
            .await
            .map_err(|err| Error::ProtocolMismatch(err.to_string()))?
            .first()
            .ok_or(Error::ProtocolMismatch(format!(
                "service {} not found",
                profile.service
            )))?
            .clone();
        let write = service
            .discover_characteristics_with_uuid(profile.write)
            .await
            .map_err(|err| Error::ProtocolMismatch(err.to_string()))?
            .first()
            .ok_or(Error::ProtocolMismatch(format!(
                "write characteristic {} not found",
                profile.write
            )))?
            .clone();
        let notify = service
            .discover_characteristics_with_uuid(profile.notify)
            .await
            .map_err(|err| Error::ProtocolMismatch(err.to_string()))?
            .first()
            .ok_or(Error::ProtocolMismatch(format!(
                "notify characteristic {} not found",
                profile.notify
            )))?
            .clone();

        if let Ok(mut endpoints) = self.endpoints.lock() {
            *endpoints = Some(Endpoints {
                write,
                notify,
                notify_id: profile.notify,
            });
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let endpoints = self
            .endpoints()
            .ok_or(Error::WriteFailed("characteristics not resolved".to_string()))?;
        endpoints
            .write
            .write(payload)
            .await
            .map_err(|err| Error::WriteFailed(err.to_string()))
    }

    async fn arm_notifications(&self) -> Result<()> {
        let Endpoints {
            notify, notify_id, ..
        } = self.endpoints().ok_or(Error::DescriptorWriteFailed(
            "characteristics not resolved".to_string(),
        ))?;
        let events = self.events.clone();
        let (armed, armed_rx) = oneshot::channel();

        let pump = tokio::spawn(async move {
            let notifications = match notify.notify().await {
                Ok(notifications) => {
                    let _ = armed.send(Ok(()));
                    notifications
                }
                Err(err) => {
                    let _ = armed.send(Err(Error::DescriptorWriteFailed(err.to_string())));
                    return;
                }
            };
            futures_util::pin_mut!(notifications);
            while let Some(item) = notifications.next().await {
                match item {
                    Ok(payload) => {
                        let event = LinkEvent::Notification {
                            characteristic: notify_id,
                            payload,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("Notification error: {err}"),
                }
            }
            debug!("End of notification stream");
            let _ = events.send(LinkEvent::Disconnected);
        });
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(previous) = slot.replace(pump) {
                previous.abort();
            }
        }

        armed_rx.await.map_err(|_| {
            Error::DescriptorWriteFailed("notification task ended".to_string())
        })?
    }

    async fn close(&self) {
        let pump = self.pump.lock().ok().and_then(|mut pump| pump.take());
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Ok(mut endpoints) = self.endpoints.lock() {
            *endpoints = None;
        }
        if let Err(err) = self.adapter.disconnect_device(&self.device).await {
            warn!("Failed to disconnect: {err}");
        }
    }
}
