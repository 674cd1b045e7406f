//! Connection State Machine
//!
//! Defines the valid transitions of a connection flow and owns the retry
//! counter that decides between another attempt and exhaustion.

/// Where a connection flow currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Flow created, nothing done yet
    Idle,
    /// Looking the peer up in the directory
    Searching,
    /// A transport open is in progress
    Connecting,
    /// Waiting out the delay before the next attempt
    RetryWait,
    /// Link open
    Connected,
    /// Flow ended without a link
    Failed,
    /// Flow abandoned by its owner
    Cancelled,
}

impl ConnectionState {
    /// No further transitions follow a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Cancelled
        )
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Directory lookup started
    SearchStarted,
    /// Target peer found among bonded devices
    PeerFound,
    /// Target peer absent
    PeerNotFound,
    /// Adapter missing or not answering
    AdapterUnavailable,
    /// Permission gate refused
    PermissionDenied,
    /// Transport open failed
    AttemptFailed,
    /// Retry delay elapsed
    RetryElapsed,
    /// Transport open succeeded
    Connected,
    /// Owner cancelled the flow
    Cancelled,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(ConnectionState),
    /// Attempt failed and another one is allowed
    RetryScheduled { attempt: u32 },
    /// Attempt failed and the cap was reached
    Exhausted { attempts: u32 },
    /// Transition was invalid from current state
    Invalid { from: ConnectionState, event: LinkEvent },
}

/// Tracks one connection flow from lookup to its terminal outcome
#[derive(Debug)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
    retry_count: u32,
    max_retries: u32,
}

impl ConnectionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new(max_retries: u32) -> Self {
        Self {
            current_state: ConnectionState::Idle,
            retry_count: 0,
            max_retries,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Failed attempts so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        if self.current_state.is_terminal() {
            return TransitionResult::Invalid {
                from: self.current_state,
                event,
            };
        }

        if event == LinkEvent::AttemptFailed && self.current_state == ConnectionState::Connecting {
            self.retry_count += 1;
            return if self.retry_count < self.max_retries {
                self.current_state = ConnectionState::RetryWait;
                TransitionResult::RetryScheduled {
                    attempt: self.retry_count,
                }
            } else {
                self.current_state = ConnectionState::Failed;
                TransitionResult::Exhausted {
                    attempts: self.retry_count,
                }
            };
        }

        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self.current_state, event) {
            // Cancellation is reachable from every live state
            (_, LinkEvent::Cancelled) => Some(Cancelled),

            (Idle, LinkEvent::SearchStarted) => Some(Searching),
            (Idle | Searching, LinkEvent::PermissionDenied) => Some(Failed),

            (Searching, LinkEvent::PeerFound) => Some(Connecting),
            (Searching, LinkEvent::PeerNotFound) => Some(Failed),
            (Searching, LinkEvent::AdapterUnavailable) => Some(Failed),

            (Connecting, LinkEvent::Connected) => Some(Connected),
            (Connecting, LinkEvent::PermissionDenied) => Some(Failed),

            (RetryWait, LinkEvent::RetryElapsed) => Some(Connecting),

            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (a, _) if a.is_terminal() => false,
        (_, Cancelled) => true,
        (Idle, Searching) => true,
        (Idle, Failed) => true,
        (Searching, Connecting) => true,
        (Searching, Failed) => true,
        (Connecting, Connected) => true,
        (Connecting, RetryWait) => true,
        (Connecting, Failed) => true,
        (RetryWait, Connecting) => true,
        _ => false,
    }
}
