//! Finding battery monitors.
//!
//! A scan runs the advertisement scan and the legacy inquiry side by side and
//! feeds both into one pipeline that deduplicates peer addresses and applies
//! the identification heuristic. Only one scan may hold the radio at a time;
//! starting a new scan (or connecting) stops the previous one first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, ScanFailure};
use crate::events::{EventSink, MonitorEvent};
use crate::protocol::{self, BRAND_MARKERS, CANONICAL_NAME, NAME_PREFIX};
use crate::radio::{Advertisement, Radio, ScanStrategy};

/// Why a peer was (or was not) taken for a battery monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchConfidence {
    ServiceUuidMatch,
    NameMatch,
    Unknown,
}

impl MatchConfidence {
    pub fn is_match(&self) -> bool {
        !matches!(self, MatchConfidence::Unknown)
    }
}

/// A peer seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    pub address: String,
    pub display_name: String,
    pub match_confidence: MatchConfidence,
    pub rssi: Option<i16>,
    /// The strategy that saw the peer first
    pub source: ScanStrategy,
}

impl PeerDevice {
    pub fn is_candidate(&self) -> bool {
        self.match_confidence.is_match()
    }
}

/// Classify an advertisement. The first rule that matches wins.
pub fn identify(adv: &Advertisement) -> MatchConfidence {
    if adv.services.contains(&protocol::PROFILE.service) {
        return MatchConfidence::ServiceUuidMatch;
    }

    let Some(name) = adv.name.as_deref().map(str::trim) else {
        return MatchConfidence::Unknown;
    };

    if name == CANONICAL_NAME || is_serial_name(name) || name.starts_with(NAME_PREFIX) {
        return MatchConfidence::NameMatch;
    }

    let lowered = name.to_ascii_lowercase();
    if BRAND_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return MatchConfidence::NameMatch;
    }

    MatchConfidence::Unknown
}

/// Units that were never renamed advertise their 12-digit hex serial
fn is_serial_name(name: &str) -> bool {
    name.len() == 12 && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// Bring an address into one canonical form so both strategies dedupe the same peer.
pub fn normalize_address(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '-' | '_' => ':',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Counters reported when a scan ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSummary {
    /// Unique addresses seen
    pub devices_found: usize,
    /// Raw callback invocations over both strategies
    pub total_callbacks: usize,
    pub matches: usize,
}

/// Bookkeeping of one scan call.
#[derive(Debug)]
pub struct ScanSession {
    started_at: Instant,
    seen: HashSet<String>,
    matched: HashSet<String>,
    raw_callbacks: usize,
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            seen: HashSet::new(),
            matched: HashSet::new(),
            raw_callbacks: 0,
        }
    }

    /// Record one callback. Every callback is classified, since a name often
    /// only arrives with a later scan response.
    ///
    /// Returns the peer on its first sighting, and once more when an address
    /// first seen without a match turns out to be a monitor.
    pub fn observe(&mut self, adv: Advertisement, source: ScanStrategy) -> Option<PeerDevice> {
        self.raw_callbacks += 1;

        let address = normalize_address(&adv.address);
        let first_sighting = self.seen.insert(address.clone());
        let match_confidence = identify(&adv);
        let first_match = match_confidence.is_match() && self.matched.insert(address.clone());

        if !first_sighting && !first_match {
            return None;
        }

        Some(PeerDevice {
            display_name: adv.name.unwrap_or_default(),
            address,
            match_confidence,
            rssi: adv.rssi,
            source,
        })
    }

    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            devices_found: self.seen.len(),
            total_callbacks: self.raw_callbacks,
            matches: self.matched.len(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveScan {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of the scanner. At most one scan is active at a time.
pub(crate) struct DiscoveryEngine {
    radio: Arc<dyn Radio>,
    events: EventSink,
    report_unmatched: bool,
    scanner: Mutex<Option<ActiveScan>>,
}

impl DiscoveryEngine {
    pub(crate) fn new(radio: Arc<dyn Radio>, events: EventSink, report_unmatched: bool) -> Self {
        Self {
            radio,
            events,
            report_unmatched,
            scanner: Mutex::new(None),
        }
    }

    /// Start both strategies. Fails only if neither could be started.
    pub(crate) async fn start_scan(&self, timeout: Duration) -> Result<()> {
        let mut scanner = self.scanner.lock().await;
        if let Some(active) = scanner.take() {
            debug!("Stopping previous scan before starting a new one");
            Self::finish(active).await;
        }

        let mut streams = Vec::new();
        let mut failure = None;
        for strategy in [ScanStrategy::Advertisement, ScanStrategy::Inquiry] {
            match self.radio.start_scan(strategy).await {
                Ok(stream) => streams.push(stream.map(move |adv| (strategy, adv)).boxed()),
                Err(code) => {
                    warn!("Failed to start {strategy:?} scan: {code}");
                    self.events.emit(MonitorEvent::Error(Error::ScanStartFailed(code)));
                    failure.get_or_insert(code);
                }
            }
        }

        if streams.is_empty() {
            return Err(Error::ScanStartFailed(failure.unwrap_or(ScanFailure::Adapter)));
        }

        info!("Scanning for {timeout:?}");
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_scan(
            self.radio.clone(),
            self.events.clone(),
            self.report_unmatched,
            stream::select_all(streams),
            timeout,
            stop_rx,
        ));
        *scanner = Some(ActiveScan { stop, task });
        Ok(())
    }

    /// Stop the active scan, if any. Returns once `ScanStopped` has been emitted.
    pub(crate) async fn stop_scan(&self) {
        let active = self.scanner.lock().await.take();
        if let Some(active) = active {
            Self::finish(active).await;
        }
    }

    pub(crate) async fn is_scanning(&self) -> bool {
        self.scanner
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    async fn finish(active: ActiveScan) {
        // Fails when the scan already timed out on its own
        let _ = active.stop.send(());
        if let Err(err) = active.task.await {
            warn!("Scan task ended abnormally: {err}");
        }
    }
}

async fn run_scan<S>(
    radio: Arc<dyn Radio>,
    events: EventSink,
    report_unmatched: bool,
    mut advertisements: S,
    timeout: Duration,
    mut stop: oneshot::Receiver<()>,
) where
    S: futures_util::Stream<Item = (ScanStrategy, Advertisement)> + Unpin,
{
    let mut session = ScanSession::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("Scan timed out");
                break;
            }
            _ = &mut stop => {
                debug!("Scan stopped");
                break;
            }
            next = advertisements.next() => match next {
                Some((strategy, adv)) => {
                    if let Some(peer) = session.observe(adv, strategy) {
                        report_peer(&events, peer, report_unmatched);
                    }
                }
                None => {
                    debug!("All scan strategies ended");
                    break;
                }
            },
        }
    }

    for strategy in [ScanStrategy::Advertisement, ScanStrategy::Inquiry] {
        radio.stop_scan(strategy).await;
    }

    let summary = session.summary();
    info!(
        "Scan finished after {:?}: {} devices, {} callbacks, {} matches",
        session.elapsed(),
        summary.devices_found,
        summary.total_callbacks,
        summary.matches
    );
    events.emit(MonitorEvent::ScanStopped(summary));
}

fn report_peer(events: &EventSink, peer: PeerDevice, report_unmatched: bool) {
    if peer.is_candidate() {
        info!(
            "Found battery monitor {} ({}) by {:?}",
            peer.address, peer.display_name, peer.match_confidence
        );
    } else {
        debug!("Ignoring {} ({})", peer.address, peer.display_name);
        if !report_unmatched {
            return;
        }
    }
    events.emit(MonitorEvent::DeviceFound(peer));
}
