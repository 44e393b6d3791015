//! Container state machine.

use std::fmt;
use std::str::FromStr;

use porto_common::{PortoError, PortoResult};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// No task, all resources released.
    Stopped,
    /// Start in progress; the task is not confirmed yet.
    Starting,
    /// The root task is alive.
    Running,
    /// Frozen together with every descendant.
    Paused,
    /// No command of its own; children drive the lifecycle.
    Meta,
    /// The task exited; runtime data is still readable.
    Dead,
    /// Restored from a snapshot, not yet reconciled with the kernel.
    #[serde(rename = "lost")]
    LostAndRestored,
    /// Being torn down; transient.
    Destroyed,
}

impl ContainerState {
    /// Whether `start` is accepted in this state.
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether `stop` is accepted in this state.
    #[must_use]
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Meta | Self::Dead)
    }

    /// Whether `pause` is accepted in this state.
    #[must_use]
    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Running | Self::Meta)
    }

    /// Whether `resume` is accepted in this state.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Whether `kill` is accepted in this state.
    #[must_use]
    pub fn can_kill(&self) -> bool {
        matches!(self, Self::Running | Self::Meta)
    }

    /// Whether a parent in this state may have a child started under it.
    #[must_use]
    pub fn allows_child_start(&self) -> bool {
        matches!(self, Self::Running | Self::Meta | Self::Starting)
    }

    /// Whether the container holds a live task or frozen task.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Paused | Self::Meta | Self::LostAndRestored
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Meta => "meta",
            Self::Dead => "dead",
            Self::LostAndRestored => "lost",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

impl FromStr for ContainerState {
    type Err = PortoError;

    fn from_str(s: &str) -> PortoResult<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "meta" => Ok(Self::Meta),
            "dead" => Ok(Self::Dead),
            "lost" => Ok(Self::LostAndRestored),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(PortoError::InvalidValue {
                message: format!("unknown container state: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_gate_correctly() {
        assert!(ContainerState::Stopped.can_start());
        assert!(!ContainerState::Running.can_start());
        assert!(ContainerState::Dead.can_stop());
        assert!(!ContainerState::Stopped.can_stop());
        assert!(ContainerState::Paused.can_resume());
        assert!(!ContainerState::Running.can_resume());
        assert!(ContainerState::Meta.can_pause());
        assert!(ContainerState::Meta.allows_child_start());
        assert!(!ContainerState::Dead.allows_child_start());
    }

    #[test]
    fn display_roundtrip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Running,
            ContainerState::Meta,
            ContainerState::Dead,
            ContainerState::LostAndRestored,
        ] {
            assert_eq!(state.to_string().parse::<ContainerState>().unwrap(), state);
        }
        assert!("bogus".parse::<ContainerState>().is_err());
    }
}
