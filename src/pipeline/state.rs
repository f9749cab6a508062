//! Session state management

use std::time::Instant;

/// Decode-feed session state machine
///
/// States only move forward: `Idle → Connecting → Streaming → Draining → Closed`.
/// A session that fails while connecting goes straight to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created, nothing acquired yet
    Idle,

    /// Channel acquired, decoder being configured and started
    Connecting,

    /// Frames are flowing from the channel into the decoder
    Streaming {
        /// When streaming started
        started_at: Instant,
    },

    /// Streaming ended, resources are being released
    Draining,

    /// Every resource has been released
    Closed,
}

impl SessionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Idle, Connecting)
                | (Connecting, Streaming { .. })
                | (Connecting, Draining)
                | (Streaming { .. }, Draining)
                | (Draining, Closed)
        )
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Streaming { .. } => "Streaming",
            SessionState::Draining => "Draining",
            SessionState::Closed => "Closed",
        }
    }

    /// Get the duration since streaming started (if streaming)
    pub fn streaming_duration(&self) -> Option<std::time::Duration> {
        if let SessionState::Streaming { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let streaming = SessionState::Streaming {
            started_at: Instant::now(),
        };

        assert!(SessionState::Idle.can_transition_to(&SessionState::Connecting));
        assert!(SessionState::Connecting.can_transition_to(&streaming));
        assert!(SessionState::Connecting.can_transition_to(&SessionState::Draining));
        assert!(streaming.can_transition_to(&SessionState::Draining));
        assert!(SessionState::Draining.can_transition_to(&SessionState::Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        let streaming = SessionState::Streaming {
            started_at: Instant::now(),
        };

        assert!(!SessionState::Idle.can_transition_to(&streaming));
        assert!(!SessionState::Idle.can_transition_to(&SessionState::Closed));
        assert!(!streaming.can_transition_to(&SessionState::Connecting));
        assert!(!SessionState::Closed.can_transition_to(&SessionState::Idle));
        // No state is re-entered
        assert!(!SessionState::Draining.can_transition_to(&SessionState::Draining));
        assert!(!streaming.can_transition_to(&streaming));
        assert!(!SessionState::Closed.can_transition_to(&SessionState::Closed));
    }

    #[test]
    fn test_state_checks() {
        let streaming = SessionState::Streaming {
            started_at: Instant::now(),
        };
        assert!(streaming.streaming_duration().is_some());
        assert!(SessionState::Draining.streaming_duration().is_none());
        assert_eq!(SessionState::Draining.to_string(), "Draining");
    }
}
