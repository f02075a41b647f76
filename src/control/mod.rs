//! External run control.
//!
//! The crawl engine never owns its control surface; it polls an injected
//! [`ControlBridge`] cooperatively before each attempt and each batch item.
//! The default bridge reports "no signal" so the engine runs unattended.
//! [`SignalQueueBridge`] is an in-memory implementation with the same
//! processed-flag semantics the production signal queue uses; operators and
//! tests drive pause/resume/stop through it.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Signal kinds an operator can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Stop,
    Pause,
    Resume,
}

/// A queued signal awaiting processing.
#[derive(Debug, Clone)]
pub struct PendingSignal {
    pub kind: SignalKind,
    pub processed: bool,
}

/// Action the engine should take after consuming pending signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stop,
    Pause,
    Resume,
    None,
}

/// Snapshot of the run state as the control surface sees it.
#[derive(Debug, Clone)]
pub struct ControlStatus {
    pub is_paused: bool,
    pub current_state: String,
}

impl ControlStatus {
    pub fn running() -> Self {
        Self {
            is_paused: false,
            current_state: "running".to_string(),
        }
    }
}

/// Source of pause/resume/stop signals, polled cooperatively by the engine.
pub trait ControlBridge: Send + Sync {
    /// Signals raised but not yet consumed. Used as a cheap pre-check before
    /// taking the serialized control path.
    fn pending_signals(&self) -> Vec<PendingSignal>;

    /// Consume pending signals and return the action to take. Each signal is
    /// processed at most once.
    fn check_control_signals(&self) -> ControlAction;

    /// Current run state.
    fn current_state(&self) -> ControlStatus;
}

/// Default bridge: no control surface attached.
pub struct NoopControlBridge;

impl ControlBridge for NoopControlBridge {
    fn pending_signals(&self) -> Vec<PendingSignal> {
        Vec::new()
    }

    fn check_control_signals(&self) -> ControlAction {
        ControlAction::None
    }

    fn current_state(&self) -> ControlStatus {
        ControlStatus::running()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<PendingSignal>,
    is_paused: bool,
    stopped: bool,
}

/// In-memory signal queue with processed-once semantics.
#[derive(Default)]
pub struct SignalQueueBridge {
    state: Mutex<QueueState>,
}

impl SignalQueueBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_stop(&self) {
        self.push(SignalKind::Stop);
    }

    pub fn send_pause(&self) {
        self.push(SignalKind::Pause);
    }

    pub fn send_resume(&self) {
        self.push(SignalKind::Resume);
    }

    fn push(&self, kind: SignalKind) {
        let mut state = self.state.lock().expect("signal queue lock poisoned");
        log::info!("control signal queued: {kind:?}");
        state.queue.push_back(PendingSignal {
            kind,
            processed: false,
        });
    }
}

impl ControlBridge for SignalQueueBridge {
    fn pending_signals(&self) -> Vec<PendingSignal> {
        let state = self.state.lock().expect("signal queue lock poisoned");
        state.queue.iter().cloned().collect()
    }

    fn check_control_signals(&self) -> ControlAction {
        let mut state = self.state.lock().expect("signal queue lock poisoned");
        // Drain in order; stop dominates anything queued behind it.
        let mut action = ControlAction::None;
        while let Some(signal) = state.queue.pop_front() {
            if signal.processed {
                continue;
            }
            match signal.kind {
                SignalKind::Stop => {
                    state.stopped = true;
                    state.is_paused = false;
                    return ControlAction::Stop;
                }
                SignalKind::Pause => {
                    state.is_paused = true;
                    action = ControlAction::Pause;
                }
                SignalKind::Resume => {
                    state.is_paused = false;
                    action = ControlAction::Resume;
                }
            }
        }
        action
    }

    fn current_state(&self) -> ControlStatus {
        let state = self.state.lock().expect("signal queue lock poisoned");
        ControlStatus {
            is_paused: state.is_paused,
            current_state: if state.stopped {
                "idle".to_string()
            } else if state.is_paused {
                "paused".to_string()
            } else {
                "running".to_string()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_bridge_reports_nothing() {
        let bridge = NoopControlBridge;
        assert!(bridge.pending_signals().is_empty());
        assert_eq!(bridge.check_control_signals(), ControlAction::None);
        assert!(!bridge.current_state().is_paused);
    }

    #[test]
    fn signals_are_consumed_once() {
        let bridge = SignalQueueBridge::new();
        bridge.send_pause();
        assert_eq!(bridge.pending_signals().len(), 1);
        assert_eq!(bridge.check_control_signals(), ControlAction::Pause);
        assert!(bridge.current_state().is_paused);
        assert_eq!(bridge.check_control_signals(), ControlAction::None);
    }

    #[test]
    fn stop_dominates_and_marks_idle() {
        let bridge = SignalQueueBridge::new();
        bridge.send_pause();
        bridge.send_stop();
        assert_eq!(bridge.check_control_signals(), ControlAction::Stop);
        assert_eq!(bridge.current_state().current_state, "idle");
    }

    #[test]
    fn resume_clears_pause() {
        let bridge = SignalQueueBridge::new();
        bridge.send_pause();
        bridge.check_control_signals();
        bridge.send_resume();
        assert_eq!(bridge.check_control_signals(), ControlAction::Resume);
        assert!(!bridge.current_state().is_paused);
    }
}
