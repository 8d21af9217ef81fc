//! Sandbox state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a project's sandbox, as seen by every viewer of the project.
///
/// A fresh project walks `Offline -> Building -> BuildingWaiting* -> Ready`,
/// then each agent turn walks `Ready -> Working -> ApplyingChanges -> Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    #[default]
    Offline,
    Building,
    /// No warm sandbox was available; retrying until the pool catches up.
    BuildingWaiting,
    Ready,
    Working,
    ApplyingChanges,
}

impl SandboxState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Every state may drop to `Offline` (kill or lost liveness). `Ready` is
    /// never re-entered from itself and `Building` is never re-entered once
    /// the sandbox has been ready.
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (_, Offline) => self != Offline,
            (Offline, Building | Ready) => true,
            (Building, BuildingWaiting | Ready) => true,
            (BuildingWaiting, BuildingWaiting | Ready) => true,
            (Ready, Working) => true,
            (Working, ApplyingChanges | Ready) => true,
            (ApplyingChanges, Ready) => true,
            _ => false,
        }
    }

    /// States in which an agent turn owns the sandbox.
    pub fn is_busy(self) -> bool {
        matches!(self, SandboxState::Working | SandboxState::ApplyingChanges)
    }

    /// States in which commands can run against a live sandbox.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SandboxState::Ready | SandboxState::Working | SandboxState::ApplyingChanges
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Offline => "OFFLINE",
            SandboxState::Building => "BUILDING",
            SandboxState::BuildingWaiting => "BUILDING_WAITING",
            SandboxState::Ready => "READY",
            SandboxState::Working => "WORKING",
            SandboxState::ApplyingChanges => "APPLYING_CHANGES",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
