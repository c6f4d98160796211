//! Discover a battery monitor, hold an encrypted session with it and stream its telemetry.
//!
//! The monitor has a BLE interface exposing one service with a write and a notify
//! characteristic. Every command and every telemetry notification is a single
//! AES-128 block. Once the start command has been written and notifications are
//! enabled, the monitor streams voltage, state of charge and temperature. It stops
//! after a while unless the start command is repeated, so a keep-alive re-sends it
//! periodically.
//!
//! All radio callbacks funnel into one channel consumed by a single actor task that
//! owns the session state machine, the keep-alive interval and the timers.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::capability::{self, Preconditions, RadioState};
use crate::config::MonitorConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::{Error, Result};
use crate::events::{EventReceiver, EventSink};
use crate::protocol::PROFILE;
use crate::radio::{GattLink, LinkEvent, Radio};
use crate::session::{ConnectionState, SessionAction, SessionInput, SessionMachine};

enum Command {
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

enum ActorInput {
    Command(Command),
    LinkOpened {
        generation: u64,
        link: Arc<dyn GattLink>,
    },
    Session {
        generation: u64,
        input: SessionInput,
    },
}

pub struct BatteryClient {
    radio: Arc<dyn Radio>,
    config: MonitorConfig,
    discovery: DiscoveryEngine,
    inbox: mpsc::UnboundedSender<ActorInput>,
    state: watch::Receiver<ConnectionState>,
    actor: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl BatteryClient {
    /// Create a client on top of `radio`. Events are delivered on the returned receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(radio: Arc<dyn Radio>, config: MonitorConfig) -> (Self, EventReceiver) {
        let (events, receiver) = EventSink::channel();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);

        let actor = SessionActor {
            radio: radio.clone(),
            machine: SessionMachine::new(config.clone()),
            events: events.clone(),
            inbox: inbox.clone(),
            link: None,
            keep_alive: None,
            command_at: None,
            watchdog_at: None,
            state: state_tx,
        };
        let actor = tokio::spawn(actor.run(inbox_rx));

        let client = Self {
            discovery: DiscoveryEngine::new(radio.clone(), events, config.report_unmatched_peers),
            radio,
            config,
            inbox,
            state,
            actor: Mutex::new(Some(actor)),
            disposed: AtomicBool::new(false),
        };
        (client, receiver)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Whether both the radio and the location permission are granted
    pub async fn has_permissions(&self) -> bool {
        self.radio.radio_permission_granted().await && self.radio.location_permission_granted().await
    }

    pub async fn is_radio_enabled(&self) -> bool {
        self.radio.radio_state().await == RadioState::Enabled
    }

    pub async fn is_location_enabled(&self) -> bool {
        self.radio.location_service_enabled().await
    }

    pub async fn check_preconditions(&self) -> Preconditions {
        capability::check_preconditions(self.radio.as_ref()).await
    }

    /// Scan for monitors for `timeout`. Found peers and the final summary arrive as events.
    pub async fn start_scan(&self, timeout: Duration) -> Result<()> {
        self.ensure_live()?;
        self.check_preconditions().await.into_result()?;

        let state = self.connection_state();
        if !matches!(state, ConnectionState::Idle | ConnectionState::Failed) {
            return Err(Error::InvalidState {
                operation: "scan",
                state,
            });
        }
        self.discovery.start_scan(timeout).await
    }

    /// Stop the current scan. Does nothing if no scan is active.
    pub async fn stop_scan(&self) {
        self.discovery.stop_scan().await;
    }

    pub async fn is_scanning(&self) -> bool {
        self.discovery.is_scanning().await
    }

    /// Start connecting to `address`. Completion is reported by the `Connected` event.
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.ensure_live()?;
        self.check_preconditions().await.into_result()?;

        let state = self.connection_state();
        if !matches!(state, ConnectionState::Idle | ConnectionState::Failed) {
            return Err(Error::InvalidState {
                operation: "connect",
                state,
            });
        }

        // discovery and connection cannot share the radio
        self.discovery.stop_scan().await;

        let (reply, response) = oneshot::channel();
        self.send(Command::Connect {
            address: address.to_string(),
            reply,
        })?;
        response.await.map_err(|_| Error::Disposed)?
    }

    /// Close the session, if any. Always safe to call.
    pub async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self.send(Command::Disconnect { reply }).is_ok() {
            let _ = response.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Ready
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver following every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop scanning, disconnect and stop the background task.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Disposing client");
        self.discovery.stop_scan().await;
        self.disconnect().await;
        let _ = self.inbox.send(ActorInput::Command(Command::Shutdown));

        let actor = self.actor.lock().ok().and_then(|mut actor| actor.take());
        if let Some(actor) = actor {
            if let Err(err) = actor.await {
                warn!("Session task ended abnormally: {err}");
            }
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inbox
            .send(ActorInput::Command(command))
            .map_err(|_| Error::Disposed)
    }
}

impl Drop for BatteryClient {
    fn drop(&mut self) {
        let _ = self.inbox.send(ActorInput::Command(Command::Shutdown));
    }
}

struct SessionActor {
    radio: Arc<dyn Radio>,
    machine: SessionMachine,
    events: EventSink,
    inbox: mpsc::UnboundedSender<ActorInput>,
    link: Option<Arc<dyn GattLink>>,
    keep_alive: Option<Interval>,
    command_at: Option<Instant>,
    watchdog_at: Option<Instant>,
    state: watch::Sender<ConnectionState>,
}

impl SessionActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ActorInput>) {
        loop {
            let command_at = self.command_at;
            let watchdog_at = self.watchdog_at;
            let generation = self.machine.generation();

            let input = tokio::select! {
                input = inbox.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                _ = tick(&mut self.keep_alive) => ActorInput::Session {
                    generation,
                    input: SessionInput::KeepAliveTick,
                },
                _ = sleep_opt(command_at) => {
                    self.command_at = None;
                    ActorInput::Session { generation, input: SessionInput::CommandTimerElapsed }
                }
                _ = sleep_opt(watchdog_at) => {
                    self.watchdog_at = None;
                    ActorInput::Session { generation, input: SessionInput::WatchdogElapsed }
                }
            };

            match input {
                ActorInput::Command(Command::Connect { address, reply }) => {
                    match self.machine.connect(&address) {
                        Ok(actions) => {
                            self.publish_state();
                            let _ = reply.send(Ok(()));
                            self.execute(actions).await;
                        }
                        Err(err) => {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
                ActorInput::Command(Command::Disconnect { reply }) => {
                    let actions = self.machine.disconnect();
                    self.execute(actions).await;
                    let _ = reply.send(());
                }
                ActorInput::Command(Command::Shutdown) => {
                    let actions = self.machine.disconnect();
                    self.execute(actions).await;
                    self.publish_state();
                    break;
                }
                ActorInput::LinkOpened { generation, link } => {
                    if generation != self.machine.generation()
                        || self.machine.state() != ConnectionState::Connecting
                    {
                        debug!("Closing link of an abandoned session");
                        tokio::spawn(async move { link.close().await });
                        continue;
                    }
                    self.link = Some(link);
                    let actions = self.machine.handle(SessionInput::LinkUp);
                    self.execute(actions).await;
                }
                ActorInput::Session { generation, input } => {
                    if generation != self.machine.generation() {
                        trace!("Discarding stale {input:?}");
                        continue;
                    }
                    let actions = self.machine.handle(input);
                    self.execute(actions).await;
                }
            }
            self.publish_state();
        }
        debug!("Session task stopped");
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Connection state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let generation = self.machine.generation();
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::OpenLink(address) => self.open_link(generation, address),
                SessionAction::ResolveServices => {
                    self.with_link(generation, |link| async move {
                        SessionInput::ServicesResolved(link.resolve(&PROFILE).await)
                    });
                }
                SessionAction::Write(frame) => {
                    debug!("TX: {}", hex::encode(frame));
                    self.with_link(generation, move |link| async move {
                        SessionInput::WriteCompleted(link.write(&frame).await)
                    });
                }
                SessionAction::ArmNotifications => {
                    self.with_link(generation, |link| async move {
                        SessionInput::ArmCompleted(link.arm_notifications().await)
                    });
                }
                SessionAction::ScheduleCommand(delay) => {
                    self.command_at = Some(Instant::now() + delay);
                }
                SessionAction::StartKeepAlive(period) => {
                    let mut interval = interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keep_alive = Some(interval);
                }
                SessionAction::StopKeepAlive => self.keep_alive = None,
                SessionAction::StartWatchdog(bound) => {
                    self.watchdog_at = Some(Instant::now() + bound);
                }
                SessionAction::StopWatchdog => self.watchdog_at = None,
                SessionAction::CloseLink => {
                    self.command_at = None;
                    if let Some(link) = self.link.take() {
                        link.close().await;
                    }
                    queue.extend(self.machine.handle(SessionInput::LinkClosed));
                }
                SessionAction::Emit(event) => self.events.emit(event),
            }
        }
    }

    fn open_link(&self, generation: u64, address: String) {
        let (link_events, mut link_rx) = mpsc::unbounded_channel();

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                let input = match event {
                    LinkEvent::Notification {
                        characteristic,
                        payload,
                    } => SessionInput::Notification {
                        characteristic,
                        payload,
                    },
                    LinkEvent::Disconnected => SessionInput::LinkLost,
                };
                if inbox.send(ActorInput::Session { generation, input }).is_err() {
                    break;
                }
            }
        });

        let radio = self.radio.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let message = match radio.open_link(&address, link_events).await {
                Ok(link) => ActorInput::LinkOpened { generation, link },
                Err(err) => ActorInput::Session {
                    generation,
                    input: SessionInput::LinkFailed(err),
                },
            };
            let _ = inbox.send(message);
        });
    }

    /// Run a GATT operation in the background and feed its completion back in.
    fn with_link<F, Fut>(&self, generation: u64, op: F)
    where
        F: FnOnce(Arc<dyn GattLink>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SessionInput> + Send + 'static,
    {
        let Some(link) = self.link.clone() else {
            warn!("No open link for GATT operation");
            return;
        };
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let input = op(link).await;
            let _ = inbox.send(ActorInput::Session { generation, input });
        });
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
