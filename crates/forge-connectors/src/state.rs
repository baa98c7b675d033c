//! Connector instance lifecycle state machine.
//!
//! Transitions are a pure table so supervisors stay declarative and
//! the set of reachable states is easy to test.

/// Runtime state of one connector instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Disabled,
    Starting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Reconnecting)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving instance transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    StartRequested,
    Started,
    ConnectionLost,
    Reconnected,
    StopRequested,
    StopCompleted,
    Disable,
}

pub fn next_state(_current: InstanceState, event: InstanceEvent) -> InstanceState {
    match event {
        InstanceEvent::StartRequested => InstanceState::Starting,
        InstanceEvent::Started => InstanceState::Running,
        InstanceEvent::ConnectionLost => InstanceState::Reconnecting,
        InstanceEvent::Reconnected => InstanceState::Running,
        InstanceEvent::StopRequested => InstanceState::Stopping,
        InstanceEvent::StopCompleted => InstanceState::Stopped,
        InstanceEvent::Disable => InstanceState::Disabled,
    }
}

pub fn transition(current: InstanceState, event: InstanceEvent) -> (InstanceState, bool) {
    let next = next_state(current, event);
    (next, next != current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = InstanceState::Disabled;
        for (event, expected) in [
            (InstanceEvent::StartRequested, InstanceState::Starting),
            (InstanceEvent::Started, InstanceState::Running),
            (InstanceEvent::ConnectionLost, InstanceState::Reconnecting),
            (InstanceEvent::Reconnected, InstanceState::Running),
            (InstanceEvent::StopRequested, InstanceState::Stopping),
            (InstanceEvent::StopCompleted, InstanceState::Stopped),
        ] {
            state = next_state(state, event);
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn transition_reports_change() {
        let (next, changed) = transition(InstanceState::Running, InstanceEvent::Reconnected);
        assert_eq!(next, InstanceState::Running);
        assert!(!changed);

        let (next, changed) = transition(InstanceState::Running, InstanceEvent::ConnectionLost);
        assert_eq!(next, InstanceState::Reconnecting);
        assert!(changed);
    }

    #[test]
    fn active_states() {
        assert!(InstanceState::Running.is_active());
        assert!(InstanceState::Reconnecting.is_active());
        assert!(!InstanceState::Stopped.is_active());
        assert!(!InstanceState::Disabled.is_active());
    }
}
