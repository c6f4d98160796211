//! A scripted in-memory radio shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use battmon::protocol::{GattProfile, PROFILE};
use battmon::radio::AdvertisementStream;
use battmon::{
    cipher, Advertisement, CapabilityProbe, ConnectionState, Error, EventReceiver, GattLink,
    LinkEvent, LinkEventSender, MonitorEvent, ProtocolVariant, Radio, RadioState, ScanFailure,
    ScanStrategy,
};

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

/// Telemetry as sent by a monitor: -42 °C, 27 %, 2.00 V
pub const TELEMETRY: &str = "d155070000012a1b00c8000000000000";

/// Operations the client performed on the radio, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    StartScan(ScanStrategy),
    StopScan(ScanStrategy),
    Open(String),
    Resolve,
    Write(Vec<u8>),
    Arm,
    Close,
}

struct Inner {
    ops: Vec<Op>,
    scans: HashMap<ScanStrategy, mpsc::UnboundedSender<Advertisement>>,
    failing_scans: HashSet<ScanStrategy>,
    radio_permission: bool,
    location_permission: bool,
    radio_state: RadioState,
    location_enabled: bool,
    hang_open: bool,
    missing_service: bool,
    fail_arm: bool,
    link_events: Option<LinkEventSender>,
}

pub struct FakeRadio {
    inner: Arc<Mutex<Inner>>,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                ops: vec![],
                scans: HashMap::new(),
                failing_scans: HashSet::new(),
                radio_permission: true,
                location_permission: true,
                radio_state: RadioState::Enabled,
                location_enabled: true,
                hang_open: false,
                missing_service: false,
                fail_arm: false,
                link_events: None,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Op) -> usize {
        self.ops().iter().filter(|op| *op == wanted).count()
    }

    pub fn position(&self, wanted: &Op) -> Option<usize> {
        self.ops().iter().position(|op| op == wanted)
    }

    pub fn set_radio_permission(&self, granted: bool) {
        self.lock().radio_permission = granted;
    }

    pub fn set_location_permission(&self, granted: bool) {
        self.lock().location_permission = granted;
    }

    pub fn set_radio_state(&self, state: RadioState) {
        self.lock().radio_state = state;
    }

    pub fn set_location_enabled(&self, enabled: bool) {
        self.lock().location_enabled = enabled;
    }

    pub fn fail_scan(&self, strategy: ScanStrategy) {
        self.lock().failing_scans.insert(strategy);
    }

    /// Make `open_link` never complete
    pub fn set_hang_open(&self, hang: bool) {
        self.lock().hang_open = hang;
    }

    pub fn set_missing_service(&self, missing: bool) {
        self.lock().missing_service = missing;
    }

    /// Make the notification descriptor write fail
    pub fn set_fail_arm(&self, fail: bool) {
        self.lock().fail_arm = fail;
    }

    /// Deliver an advertisement through a running scan
    pub fn advertise(&self, strategy: ScanStrategy, address: &str, name: Option<&str>) {
        let adv = Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            services: vec![],
            rssi: Some(-70),
        };
        let inner = self.lock();
        let sender = inner.scans.get(&strategy).expect("scan not running");
        sender.send(adv).unwrap();
    }

    pub fn notify_raw(&self, payload: Vec<u8>) {
        let inner = self.lock();
        let events = inner.link_events.as_ref().expect("no open link");
        let _ = events.send(LinkEvent::Notification {
            characteristic: PROFILE.notify,
            payload,
        });
    }

    /// Send `plaintext_hex` encrypted with the key of `variant`
    pub fn notify(&self, variant: ProtocolVariant, plaintext_hex: &str) {
        let plaintext = hex::decode(plaintext_hex).unwrap();
        let frame = cipher::encrypt(&plaintext, variant.key()).unwrap();
        self.notify_raw(frame.to_vec());
    }

    /// Simulate the monitor going out of range
    pub fn drop_link(&self) {
        let inner = self.lock();
        let events = inner.link_events.as_ref().expect("no open link");
        let _ = events.send(LinkEvent::Disconnected);
    }
}

#[async_trait]
impl CapabilityProbe for FakeRadio {
    async fn radio_permission_granted(&self) -> bool {
        self.lock().radio_permission
    }

    async fn location_permission_granted(&self) -> bool {
        self.lock().location_permission
    }

    async fn radio_state(&self) -> RadioState {
        self.lock().radio_state
    }

    async fn location_service_enabled(&self) -> bool {
        self.lock().location_enabled
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn start_scan(
        &self,
        strategy: ScanStrategy,
    ) -> Result<AdvertisementStream, ScanFailure> {
        let mut inner = self.lock();
        inner.ops.push(Op::StartScan(strategy));
        if inner.failing_scans.contains(&strategy) {
            return Err(ScanFailure::Unsupported);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.scans.insert(strategy, tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|adv| (adv, rx)) }).boxed())
    }

    async fn stop_scan(&self, strategy: ScanStrategy) {
        let mut inner = self.lock();
        inner.ops.push(Op::StopScan(strategy));
        inner.scans.remove(&strategy);
    }

    async fn open_link(
        &self,
        address: &str,
        events: LinkEventSender,
    ) -> battmon::Result<Arc<dyn GattLink>> {
        let hang = {
            let mut inner = self.lock();
            inner.ops.push(Op::Open(address.to_string()));
            inner.hang_open
        };
        if hang {
            pending::<()>().await;
        }
        self.lock().link_events = Some(events);
        Ok(Arc::new(FakeLink {
            inner: self.inner.clone(),
        }))
    }
}

struct FakeLink {
    inner: Arc<Mutex<Inner>>,
}

impl FakeLink {
    fn record(&self, op: Op) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(op);
        inner
    }
}

#[async_trait]
impl GattLink for FakeLink {
    async fn resolve(&self, profile: &GattProfile) -> battmon::Result<()> {
        let inner = self.record(Op::Resolve);
        if inner.missing_service {
            return Err(Error::ProtocolMismatch(format!(
                "service {} not found",
                profile.service
            )));
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> battmon::Result<()> {
        self.record(Op::Write(payload.to_vec()));
        Ok(())
    }

    async fn arm_notifications(&self) -> battmon::Result<()> {
        let inner = self.record(Op::Arm);
        if inner.fail_arm {
            return Err(Error::DescriptorWriteFailed("cccd write rejected".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(Op::Close).link_events = None;
    }
}

/// Next event, failing the test if none arrives within a minute
pub async fn next_event(events: &mut EventReceiver) -> MonitorEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("no event within a minute")
        .expect("event channel closed")
}

pub async fn assert_no_event(events: &mut EventReceiver, within: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(within, events.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

pub async fn wait_for_state(
    mut state: tokio::sync::watch::Receiver<ConnectionState>,
    wanted: ConnectionState,
) {
    tokio::time::timeout(Duration::from_secs(60), state.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached within a minute")
        .expect("client dropped");
}

/// Let spawned tasks run without advancing the clock much
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
