//! Runtime preconditions checked before every scan and connect attempt.

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Error, Permission};

/// Power state of the Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    /// No adapter present
    Unavailable,
    Disabled,
    Enabled,
}

/// Platform queries behind the capability gate.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn radio_permission_granted(&self) -> bool;
    async fn location_permission_granted(&self) -> bool;
    async fn radio_state(&self) -> RadioState;
    async fn location_service_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    RadioPermission,
    LocationPermission,
    RadioUnavailable,
    RadioDisabled,
}

impl From<DenialReason> for Error {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::RadioPermission => Error::PermissionDenied(Permission::Radio),
            DenialReason::LocationPermission => Error::PermissionDenied(Permission::Location),
            DenialReason::RadioUnavailable => Error::RadioUnavailable,
            DenialReason::RadioDisabled => Error::RadioDisabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preconditions {
    /// Scanning and connecting may proceed. Discovery may be partial when the
    /// location service is off.
    Ready { location_service_disabled: bool },
    Denied(DenialReason),
}

impl Preconditions {
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Preconditions::Ready { .. } => Ok(()),
            Preconditions::Denied(reason) => Err(reason.into()),
        }
    }
}

/// Check the preconditions in priority order. The first failing one wins.
pub async fn check_preconditions<P: CapabilityProbe + ?Sized>(probe: &P) -> Preconditions {
    if !probe.radio_permission_granted().await {
        return Preconditions::Denied(DenialReason::RadioPermission);
    }
    if !probe.location_permission_granted().await {
        return Preconditions::Denied(DenialReason::LocationPermission);
    }
    match probe.radio_state().await {
        RadioState::Unavailable => return Preconditions::Denied(DenialReason::RadioUnavailable),
        RadioState::Disabled => return Preconditions::Denied(DenialReason::RadioDisabled),
        RadioState::Enabled => {}
    }

    let location_service_disabled = !probe.location_service_enabled().await;
    if location_service_disabled {
        warn!("Location service is disabled, discovery may miss devices");
    }
    Preconditions::Ready {
        location_service_disabled,
    }
}
