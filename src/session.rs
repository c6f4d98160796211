//! The connection lifecycle as an explicit state machine.
//!
//! [`SessionMachine`] is synchronous and does no I/O: radio callbacks and timer
//! expiries are fed in as [`SessionInput`]s and it answers with the
//! [`SessionAction`]s to perform. The client's actor task executes the actions
//! and feeds the results back in.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::cipher::Frame;
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::events::MonitorEvent;
use crate::protocol::{CommandOrdering, ProtocolVariant, PROFILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    ServicesDiscovered,
    AwaitingNotificationArm,
    Ready,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether a connection attempt is underway but not yet ready
    fn is_handshaking(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::ServicesDiscovered
                | ConnectionState::AwaitingNotificationArm
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Command,
    Arm,
}

/// Callbacks and timer expiries driving the machine.
#[derive(Debug)]
pub enum SessionInput {
    LinkUp,
    LinkFailed(Error),
    ServicesResolved(Result<()>),
    CommandTimerElapsed,
    WriteCompleted(Result<()>),
    ArmCompleted(Result<()>),
    Notification { characteristic: Uuid, payload: Vec<u8> },
    KeepAliveTick,
    WatchdogElapsed,
    /// The link dropped without being asked to
    LinkLost,
    /// The link was closed on our request
    LinkClosed,
}

/// Work requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    OpenLink(String),
    ResolveServices,
    Write(Frame),
    ArmNotifications,
    ScheduleCommand(Duration),
    StartKeepAlive(Duration),
    StopKeepAlive,
    StartWatchdog(Duration),
    StopWatchdog,
    CloseLink,
    Emit(MonitorEvent),
}

/// The data of the one session that may exist at a time.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer_address: String,
    pub notifications_armed: bool,
    pub last_command_sent_at: Option<Instant>,
    pub keep_alive_active: bool,
    /// Variant currently used to encrypt commands and decode telemetry
    pub variant: ProtocolVariant,
    ordering: CommandOrdering,
    arm_requested: bool,
    pending_write: Option<PendingWrite>,
    command_due: bool,
    rejected_streak: u32,
}

impl Session {
    fn new(peer_address: String, variant: ProtocolVariant) -> Self {
        Self {
            peer_address,
            notifications_armed: false,
            last_command_sent_at: None,
            keep_alive_active: false,
            variant,
            ordering: variant.ordering(),
            arm_requested: false,
            pending_write: None,
            command_due: false,
            rejected_streak: 0,
        }
    }
}

pub struct SessionMachine {
    config: MonitorConfig,
    state: ConnectionState,
    session: Option<Session>,
    generation: u64,
}

impl SessionMachine {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            session: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Incremented on every connect. Callbacks from an earlier session carry a
    /// stale generation and must be discarded by the caller.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin a new session. Allowed from `Idle`, or from `Failed` which ends the dead session.
    pub fn connect(&mut self, address: &str) -> Result<Vec<SessionAction>> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Failed) {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        self.generation += 1;
        self.session = Some(Session::new(address.to_string(), self.config.variant));
        self.state = ConnectionState::Connecting;
        info!("Connecting to {address} using {:?} protocol", self.config.variant);

        Ok(vec![
            SessionAction::StartWatchdog(self.config.connect_timeout),
            SessionAction::OpenLink(address.to_string()),
        ])
    }

    /// Tear the session down. Always safe to call.
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnecting => vec![],
            ConnectionState::Failed => {
                self.state = ConnectionState::Idle;
                self.session = None;
                vec![]
            }
            _ => {
                info!("Disconnecting");
                self.state = ConnectionState::Disconnecting;
                let mut actions = self.stop_timers();
                actions.push(SessionAction::CloseLink);
                actions
            }
        }
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        trace!("{:?} <- {:?}", self.state, input);
        match input {
            SessionInput::LinkUp => {
                if self.state != ConnectionState::Connecting {
                    debug!("Ignoring link-up while {:?}", self.state);
                    return vec![];
                }
                debug!("Link up, discovering services");
                vec![SessionAction::ResolveServices]
            }
            SessionInput::LinkFailed(err) => {
                if self.state != ConnectionState::Connecting {
                    return vec![];
                }
                self.fail(err)
            }
            SessionInput::ServicesResolved(result) => {
                if self.state != ConnectionState::Connecting {
                    return vec![];
                }
                if let Err(err) = result {
                    return self.fail(err);
                }
                self.state = ConnectionState::ServicesDiscovered;
                match self.session_mut().map(|s| s.ordering) {
                    Some(CommandOrdering::NotifyFirst) => self.request_arm(),
                    Some(CommandOrdering::CommandFirst) => self.send_command(),
                    None => vec![],
                }
            }
            SessionInput::WriteCompleted(result) => self.on_write_completed(result),
            SessionInput::ArmCompleted(result) => self.on_arm_completed(result),
            SessionInput::CommandTimerElapsed => {
                if self.state != ConnectionState::Ready {
                    return vec![];
                }
                self.send_command()
            }
            SessionInput::KeepAliveTick => self.on_keep_alive(),
            SessionInput::Notification {
                characteristic,
                payload,
            } => self.on_notification(characteristic, payload),
            SessionInput::WatchdogElapsed => {
                if !self.state.is_handshaking() {
                    return vec![];
                }
                warn!("Connection attempt did not complete in {:?}", self.config.connect_timeout);
                self.fail(Error::ConnectTimeout(self.config.connect_timeout))
            }
            SessionInput::LinkLost => self.on_link_lost(),
            SessionInput::LinkClosed => {
                if self.state != ConnectionState::Disconnecting {
                    return vec![];
                }
                let was_connected = self
                    .session
                    .take()
                    .is_some_and(|s| s.notifications_armed);
                self.state = ConnectionState::Idle;
                if was_connected {
                    vec![SessionAction::Emit(MonitorEvent::Disconnected)]
                } else {
                    vec![]
                }
            }
        }
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    fn on_write_completed(&mut self, result: Result<()>) -> Vec<SessionAction> {
        let state = self.state;
        let Some(session) = self.session_mut() else {
            return vec![];
        };
        if session.pending_write == Some(PendingWrite::Command) {
            session.pending_write = None;
        } else {
            debug!("Write completion without an outstanding command write");
        }

        if !state.is_handshaking() && state != ConnectionState::Ready {
            debug!("Ignoring write completion while {state:?}");
            return vec![];
        }
        if let Err(err) = result {
            if state == ConnectionState::Ready {
                warn!("Keep-alive write failed: {err}");
                return self.send_due_command();
            }
            return self.fail(err);
        }

        let mut actions = vec![];
        if session.ordering == CommandOrdering::CommandFirst && state.is_handshaking() {
            actions.extend(self.request_arm());
        }
        actions.extend(self.send_due_command());
        actions
    }

    fn on_arm_completed(&mut self, result: Result<()>) -> Vec<SessionAction> {
        let state = self.state;
        let keep_alive_interval = self.config.keep_alive_interval;
        let command_delay = self.config.command_delay;
        let Some(session) = self.session_mut() else {
            return vec![];
        };
        if session.pending_write == Some(PendingWrite::Arm) {
            session.pending_write = None;
        }

        if !state.is_handshaking() && state != ConnectionState::Ready {
            debug!("Ignoring arm completion while {state:?}");
            return vec![];
        }
        if let Err(err) = result {
            if state == ConnectionState::Ready {
                warn!("Ignoring failed re-arm: {err}");
                return vec![];
            }
            return self.fail(err);
        }

        if session.notifications_armed {
            debug!("Notifications already armed");
            return self.send_due_command();
        }
        if state != ConnectionState::AwaitingNotificationArm {
            return vec![];
        }

        session.notifications_armed = true;
        session.keep_alive_active = true;
        let ordering = session.ordering;
        self.state = ConnectionState::Ready;
        info!("Session ready");

        let mut actions = vec![
            SessionAction::StopWatchdog,
            SessionAction::Emit(MonitorEvent::Connected),
            SessionAction::StartKeepAlive(keep_alive_interval),
        ];
        if ordering == CommandOrdering::NotifyFirst {
            actions.push(SessionAction::ScheduleCommand(command_delay));
        }
        actions.extend(self.send_due_command());
        actions
    }

    fn on_keep_alive(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Ready {
            return vec![];
        }
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.pending_write.is_some())
        {
            debug!("Skipping keep-alive, previous write still outstanding");
            return vec![];
        }
        self.send_command()
    }

    fn on_notification(&mut self, characteristic: Uuid, payload: Vec<u8>) -> Vec<SessionAction> {
        if characteristic != PROFILE.notify {
            trace!("Ignoring notification on {characteristic}");
            return vec![];
        }
        let auto_detect = self.config.auto_detect_variant;
        let threshold = self.config.auto_detect_threshold;
        let Some(session) = self.session_mut() else {
            return vec![];
        };
        debug!("RX notification: 0x{}", hex::encode(&payload));

        match session.variant.decode_notification(&payload) {
            Ok(frame) => {
                session.rejected_streak = 0;
                vec![SessionAction::Emit(MonitorEvent::Data(frame))]
            }
            Err(Error::InvalidFrameLength(len)) => {
                debug!("Dropping {len}-byte notification");
                vec![]
            }
            Err(err) => {
                trace!("Dropping notification: {err}");
                session.rejected_streak += 1;
                if !auto_detect || session.rejected_streak < threshold {
                    return vec![];
                }
                session.rejected_streak = 0;
                session.variant = session.variant.other();
                info!(
                    "Frames keep failing to decode, switching to {:?} protocol",
                    session.variant
                );
                self.send_command()
            }
        }
    }

    fn on_link_lost(&mut self) -> Vec<SessionAction> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Failed => vec![],
            ConnectionState::Disconnecting => self.handle(SessionInput::LinkClosed),
            _ => {
                info!("Link lost");
                let mut actions = self.stop_timers();
                actions.push(SessionAction::CloseLink);
                actions.push(SessionAction::Emit(MonitorEvent::Disconnected));
                self.state = ConnectionState::Idle;
                self.session = None;
                actions
            }
        }
    }

    fn request_arm(&mut self) -> Vec<SessionAction> {
        let Some(session) = self.session_mut() else {
            return vec![];
        };
        if session.arm_requested || session.notifications_armed {
            debug!("Notification arming already requested, not re-arming");
            return vec![];
        }
        if session.pending_write.is_some() {
            warn!("Arming notifications while a write is outstanding");
        }
        session.arm_requested = true;
        session.pending_write = Some(PendingWrite::Arm);
        self.state = ConnectionState::AwaitingNotificationArm;
        vec![SessionAction::ArmNotifications]
    }

    /// Send the start command now, or once the outstanding write completes.
    fn send_command(&mut self) -> Vec<SessionAction> {
        let Some(session) = self.session_mut() else {
            return vec![];
        };
        if session.pending_write.is_some() {
            session.command_due = true;
            return vec![];
        }

        match session.variant.encrypted_start_command() {
            Ok(frame) => {
                session.command_due = false;
                session.pending_write = Some(PendingWrite::Command);
                session.last_command_sent_at = Some(Instant::now());
                vec![SessionAction::Write(frame)]
            }
            Err(err) => vec![SessionAction::Emit(MonitorEvent::Error(err))],
        }
    }

    fn send_due_command(&mut self) -> Vec<SessionAction> {
        match self.session.as_ref() {
            Some(s) if s.command_due && s.pending_write.is_none() => self.send_command(),
            _ => vec![],
        }
    }

    fn stop_timers(&mut self) -> Vec<SessionAction> {
        let mut actions = vec![SessionAction::StopWatchdog];
        if let Some(session) = self.session_mut() {
            if session.keep_alive_active {
                session.keep_alive_active = false;
                actions.push(SessionAction::StopKeepAlive);
            }
        }
        actions
    }

    fn fail(&mut self, err: Error) -> Vec<SessionAction> {
        warn!("Session failed: {err}");
        let mut actions = self.stop_timers();
        actions.push(SessionAction::CloseLink);
        actions.push(SessionAction::Emit(MonitorEvent::Error(err)));
        self.state = ConnectionState::Failed;
        actions
    }
}
