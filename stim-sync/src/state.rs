//! Cycle state machine and pipeline lifecycle state

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Where a single cycle is in its acquire -> process -> project loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Idle = 0,
    WaitingTrigger = 1,
    Capturing = 2,
    Processing = 3,
    Projecting = 4,
    Draining = 5,
    Faulted = 6,
}

/// What happened to a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    /// Ready for the next trigger
    Armed,
    Triggered,
    TriggerTimeout,
    /// Trigger arrived but no buffer was free
    PoolExhausted,
    Captured,
    Underrun,
    /// Result returned (possibly overrun)
    Processed,
    /// Result past the lateness threshold; projection skipped
    DroppedLate,
    /// Pattern handed to the projector, or dropped because it was busy
    Dispatched,
    Drain,
    Drained,
    DeviceFault,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from:?} on {event:?}")]
pub struct InvalidCycleTransition {
    pub from: SyncState,
    pub event: CycleEvent,
}

impl SyncState {
    fn next(self, event: CycleEvent) -> Option<SyncState> {
        use CycleEvent as E;
        use SyncState as S;

        match (self, event) {
            // Faulted only leaves on an explicit reset
            (S::Faulted, E::Reset) => Some(S::Idle),
            (S::Faulted, _) => None,
            (_, E::DeviceFault) => Some(S::Faulted),
            (S::Draining, E::Drained) => Some(S::Idle),
            (S::Draining, _) => None,
            (_, E::Drain) => Some(S::Draining),

            (S::Idle, E::Armed) => Some(S::WaitingTrigger),
            (S::WaitingTrigger, E::Triggered) => Some(S::Capturing),
            (S::WaitingTrigger, E::TriggerTimeout) => Some(S::WaitingTrigger),
            (S::WaitingTrigger, E::PoolExhausted) => Some(S::WaitingTrigger),
            (S::Capturing, E::Underrun) => Some(S::WaitingTrigger),
            (S::Capturing, E::TriggerTimeout) => Some(S::WaitingTrigger),
            (S::Capturing, E::Captured) => Some(S::Processing),
            (S::Processing, E::Processed) => Some(S::Projecting),
            (S::Processing, E::DroppedLate) => Some(S::Idle),
            (S::Projecting, E::Dispatched) => Some(S::Idle),
            _ => None,
        }
    }

    pub fn on(self, event: CycleEvent) -> Result<SyncState, InvalidCycleTransition> {
        self.next(event)
            .ok_or(InvalidCycleTransition { from: self, event })
    }
}

/// Externally visible lifecycle of the whole pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Faulted = 3,
}

/// Enums that can live in an [`AtomicState`]
pub trait StateRepr: Copy {
    fn to_raw(self) -> u8;
    fn from_raw(raw: u8) -> Self;
}

impl StateRepr for SyncState {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => SyncState::WaitingTrigger,
            2 => SyncState::Capturing,
            3 => SyncState::Processing,
            4 => SyncState::Projecting,
            5 => SyncState::Draining,
            6 => SyncState::Faulted,
            _ => SyncState::Idle,
        }
    }
}

impl StateRepr for PipelineState {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            3 => PipelineState::Faulted,
            _ => PipelineState::Idle,
        }
    }
}

/// Lock-free state cell readable from any thread
pub struct AtomicState<S> {
    raw: AtomicU8,
    _marker: PhantomData<S>,
}

impl<S: StateRepr> AtomicState<S> {
    pub fn new(state: S) -> Self {
        Self {
            raw: AtomicU8::new(state.to_raw()),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    pub fn set(&self, state: S) {
        self.raw.store(state.to_raw(), Ordering::Release);
    }

    /// Move `from` -> `to`; returns the actual state on failure
    pub fn transition(&self, from: S, to: S) -> Result<(), S> {
        self.raw
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(S::from_raw)
    }
}

impl AtomicState<SyncState> {
    /// Apply a cycle event. An impossible transition is a bug: it is logged
    /// and the cell is left unchanged.
    pub fn advance(&self, event: CycleEvent) -> SyncState {
        let current = self.get();
        match current.on(event) {
            Ok(next) => {
                self.set(next);
                next
            }
            Err(e) => {
                log::error!("Cycle state machine: {}", e);
                current
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut state = SyncState::Idle;
        for event in [
            CycleEvent::Armed,
            CycleEvent::Triggered,
            CycleEvent::Captured,
            CycleEvent::Processed,
            CycleEvent::Dispatched,
        ] {
            state = state.on(event).unwrap();
        }
        assert_eq!(state, SyncState::Idle);
    }

    #[test]
    fn test_recoverable_events_return_to_waiting() {
        let waiting = SyncState::WaitingTrigger;
        assert_eq!(waiting.on(CycleEvent::PoolExhausted), Ok(SyncState::WaitingTrigger));
        assert_eq!(waiting.on(CycleEvent::TriggerTimeout), Ok(SyncState::WaitingTrigger));
        assert_eq!(SyncState::Capturing.on(CycleEvent::Underrun), Ok(SyncState::WaitingTrigger));
        assert_eq!(SyncState::Processing.on(CycleEvent::DroppedLate), Ok(SyncState::Idle));
    }

    #[test]
    fn test_faulted_is_terminal_until_reset() {
        let faulted = SyncState::Capturing.on(CycleEvent::DeviceFault).unwrap();
        assert_eq!(faulted, SyncState::Faulted);
        assert!(faulted.on(CycleEvent::Armed).is_err());
        assert!(faulted.on(CycleEvent::Drain).is_err());
        assert_eq!(faulted.on(CycleEvent::Reset), Ok(SyncState::Idle));
    }

    #[test]
    fn test_drain() {
        let draining = SyncState::Processing.on(CycleEvent::Drain).unwrap();
        assert!(draining.on(CycleEvent::Triggered).is_err());
        assert_eq!(draining.on(CycleEvent::Drained), Ok(SyncState::Idle));
        assert_eq!(draining.on(CycleEvent::DeviceFault), Ok(SyncState::Faulted));
    }

    #[test]
    fn test_invalid_transition() {
        let err = SyncState::Idle.on(CycleEvent::Captured).unwrap_err();
        assert_eq!(err.from, SyncState::Idle);
        assert_eq!(err.event, CycleEvent::Captured);
    }

    #[test]
    fn test_atomic_state() {
        let cell = AtomicState::new(PipelineState::Idle);
        assert_eq!(cell.transition(PipelineState::Idle, PipelineState::Running), Ok(()));
        assert_eq!(
            cell.transition(PipelineState::Idle, PipelineState::Running),
            Err(PipelineState::Running)
        );
        cell.set(PipelineState::Faulted);
        assert_eq!(cell.get(), PipelineState::Faulted);

        let cycle = AtomicState::new(SyncState::Idle);
        assert_eq!(cycle.advance(CycleEvent::Armed), SyncState::WaitingTrigger);
    }
}
