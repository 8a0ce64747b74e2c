use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::audio::lock;

/// Lifecycle of one realtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Configuring,
    Idle,
    Listening,
    Responding,
    Erroring,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;

        if self == next {
            return true;
        }
        match (self, next) {
            // disconnect() is valid from anywhere
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected | Idle | Listening | Responding, Configuring) => true,
            (Connected | Configuring | Idle | Listening | Responding, Erroring) => true,
            (Configuring, Idle) => true,
            (Idle, Listening | Responding) => true,
            (Listening, Idle | Responding) => true,
            // Server VAD may hear the user while a reply is still streaming
            (Responding, Idle | Listening) => true,
            _ => false,
        }
    }

    /// Check `next` against the table; invalid moves are logged and refused.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.can_transition(next) {
            log::warn!("Refusing session state transition {} -> {}", self, next);
            return false;
        }
        if *self != next {
            log::debug!("Session state {} -> {}", self, next);
            *self = next;
        }
        true
    }

    pub fn is_connected(self) -> bool {
        !matches!(
            self,
            SessionState::Disconnected | SessionState::Connecting | SessionState::Erroring
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Response bookkeeping shared by the session and its receive loop.
#[derive(Debug, Default)]
pub struct PendingResponse {
    processing: AtomicBool,
    playing: AtomicBool,
    interrupted: AtomicBool,
}

/// Point-in-time copy of [`PendingResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingSnapshot {
    pub is_processing: bool,
    pub is_playing: bool,
    pub interrupted: bool,
}

impl PendingResponse {
    /// A new request went out; any previous interrupt no longer applies.
    pub fn begin(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
        self.processing.store(true, Ordering::SeqCst);
    }

    pub fn mark_playing(&self) {
        self.playing.store(true, Ordering::SeqCst);
    }

    pub fn interrupt(&self) {
        self.processing.store(false, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Response finished, failed or was confirmed cancelled.
    pub fn clear(&self) {
        self.processing.store(false, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            is_processing: self.processing.load(Ordering::SeqCst),
            is_playing: self.playing.load(Ordering::SeqCst),
            interrupted: self.interrupted.load(Ordering::SeqCst),
        }
    }
}

/// How an inbound response event relates to what the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// First event of a response we still want.
    New,
    /// Belongs to the response already in progress, or carries no id.
    Current,
    /// Belongs to a response the client cancelled.
    Cancelled,
}

#[derive(Debug, Default)]
struct TrackerState {
    current: Option<String>,
    cancelled: HashSet<String>,
    /// Cancelled responses whose id was not known at cancel time
    unlabelled: usize,
}

/// Remembers cancelled responses so their late events can be dropped after
/// the next request is already out. Server events for one response never
/// interleave with the next one, so a cancel issued before the id was seen
/// claims the next unseen id.
#[derive(Debug, Default)]
pub struct ResponseTracker {
    state: Mutex<TrackerState>,
}

impl ResponseTracker {
    /// Cancel whatever is in flight. `in_flight` says whether a request was
    /// still waiting on its reply.
    pub fn cancel_current(&self, in_flight: bool) {
        let mut state = lock(&self.state);
        match state.current.take() {
            Some(id) => {
                state.cancelled.insert(id);
            }
            None if in_flight => state.unlabelled += 1,
            None => {}
        }
    }

    /// Classify a reply event by its response id.
    pub fn admit(&self, response_id: Option<&str>) -> ResponseOrigin {
        let mut state = lock(&self.state);
        let Some(id) = response_id else {
            return if state.unlabelled > 0 {
                ResponseOrigin::Cancelled
            } else {
                ResponseOrigin::Current
            };
        };
        if state.cancelled.contains(id) {
            return ResponseOrigin::Cancelled;
        }
        if state.current.as_deref() == Some(id) {
            return ResponseOrigin::Current;
        }
        if state.unlabelled > 0 {
            state.unlabelled -= 1;
            state.cancelled.insert(id.to_string());
            return ResponseOrigin::Cancelled;
        }
        state.current = Some(id.to_string());
        ResponseOrigin::New
    }

    /// `response.done` arrived. Returns true when it ends a cancelled
    /// response, which then no longer needs tracking.
    pub fn finish(&self, response_id: Option<&str>) -> bool {
        match self.admit(response_id) {
            ResponseOrigin::Cancelled => {
                let mut state = lock(&self.state);
                match response_id {
                    Some(id) => {
                        state.cancelled.remove(id);
                    }
                    None => state.unlabelled = state.unlabelled.saturating_sub(1),
                }
                true
            }
            ResponseOrigin::New | ResponseOrigin::Current => {
                lock(&self.state).current = None;
                false
            }
        }
    }

    /// The server reported nothing left to cancel.
    pub fn settle(&self) {
        lock(&self.state).unlabelled = 0;
    }

    pub fn reset(&self) {
        *lock(&self.state) = TrackerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn happy_path_is_accepted() {
        let mut state = Disconnected;
        for next in [Connecting, Connected, Configuring, Idle, Listening, Idle, Responding, Idle] {
            assert!(state.transition(next), "-> {}", next);
        }
        assert_eq!(state, Idle);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let mut state = Disconnected;
        assert!(!state.transition(Idle));
        assert_eq!(state, Disconnected);

        let mut state = Erroring;
        assert!(!state.transition(Idle));
        assert!(state.transition(Disconnected));

        assert!(!Connecting.can_transition(Responding));
        assert!(!Connected.can_transition(Listening));
    }

    #[test]
    fn disconnect_allowed_from_everywhere() {
        for s in [Connecting, Connected, Configuring, Idle, Listening, Responding, Erroring] {
            assert!(s.can_transition(Disconnected));
        }
    }

    #[test]
    fn connected_states() {
        assert!(!Disconnected.is_connected());
        assert!(!Connecting.is_connected());
        assert!(Idle.is_connected());
        assert!(Responding.is_connected());
    }

    #[test]
    fn pending_flags_follow_interrupt_and_begin() {
        let pending = PendingResponse::default();
        pending.begin();
        pending.mark_playing();
        assert_eq!(
            pending.snapshot(),
            PendingSnapshot { is_processing: true, is_playing: true, interrupted: false }
        );

        pending.interrupt();
        assert_eq!(
            pending.snapshot(),
            PendingSnapshot { is_processing: false, is_playing: false, interrupted: true }
        );

        pending.begin();
        assert!(!pending.is_interrupted());
        pending.clear();
        assert_eq!(pending.snapshot(), PendingSnapshot::default());
    }

    #[test]
    fn cancelled_response_is_dropped_until_done() {
        let tracker = ResponseTracker::default();
        assert_eq!(tracker.admit(Some("resp_1")), ResponseOrigin::New);
        assert_eq!(tracker.admit(Some("resp_1")), ResponseOrigin::Current);

        tracker.cancel_current(true);
        assert_eq!(tracker.admit(Some("resp_1")), ResponseOrigin::Cancelled);
        assert_eq!(tracker.admit(Some("resp_2")), ResponseOrigin::New);
        assert!(tracker.finish(Some("resp_1")));
        assert!(!tracker.finish(Some("resp_2")));
        assert_eq!(tracker.admit(Some("resp_3")), ResponseOrigin::New);
    }

    #[test]
    fn cancel_before_id_claims_next_unseen_response() {
        let tracker = ResponseTracker::default();
        tracker.cancel_current(true);
        assert_eq!(tracker.admit(None), ResponseOrigin::Cancelled);
        assert_eq!(tracker.admit(Some("resp_1")), ResponseOrigin::Cancelled);
        assert_eq!(tracker.admit(Some("resp_2")), ResponseOrigin::New);
        assert_eq!(tracker.admit(None), ResponseOrigin::Current);
    }

    #[test]
    fn idle_cancel_and_settle_leave_nothing_behind() {
        let tracker = ResponseTracker::default();
        tracker.cancel_current(false);
        assert_eq!(tracker.admit(Some("resp_1")), ResponseOrigin::New);

        tracker.reset();
        tracker.cancel_current(true);
        tracker.settle();
        assert!(!tracker.finish(None));
        assert_eq!(tracker.admit(Some("resp_2")), ResponseOrigin::New);
    }
}
