// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The satellite finite state machine.
//!
//! Steady states occupy the high nibble of the state byte; transitional
//! states encode their target so that `(value & 0x0F) << 4` names the
//! steady state a `complete` advances to. Transitions are the only
//! mutation point; reads are atomic loads of the current state value.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{DecodeError, SatelliteError};

/// States a satellite cycles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SatelliteState {
    /// Idle state without any configuration.
    New = 0x10,
    /// Initialized state with configuration but not (fully) applied.
    Init = 0x20,
    /// Prepared state where configuration is applied.
    Orbit = 0x30,
    /// Running state where the acquisition is active.
    Run = 0x40,
    /// Safe fallback state if an error is discovered during a run.
    Safe = 0xE0,
    /// Error state if something went wrong.
    Error = 0xF0,
    /// Final state after shutdown.
    Dead = 0xFF,

    Initializing = 0x12,
    Launching = 0x23,
    Landing = 0x32,
    Reconfiguring = 0x33,
    Starting = 0x34,
    Stopping = 0x43,
    Interrupting = 0x0E,
}

impl SatelliteState {
    pub fn from_int(value: i64) -> Result<SatelliteState, DecodeError> {
        u8::try_from(value)
            .ok()
            .and_then(SatelliteState::from_u8)
            .ok_or_else(|| DecodeError::malformed(format!("state {value:#x} out of range")))
    }

    pub fn from_u8(value: u8) -> Option<SatelliteState> {
        match value {
            0x10 => Some(SatelliteState::New),
            0x20 => Some(SatelliteState::Init),
            0x30 => Some(SatelliteState::Orbit),
            0x40 => Some(SatelliteState::Run),
            0xE0 => Some(SatelliteState::Safe),
            0xF0 => Some(SatelliteState::Error),
            0xFF => Some(SatelliteState::Dead),
            0x12 => Some(SatelliteState::Initializing),
            0x23 => Some(SatelliteState::Launching),
            0x32 => Some(SatelliteState::Landing),
            0x33 => Some(SatelliteState::Reconfiguring),
            0x34 => Some(SatelliteState::Starting),
            0x43 => Some(SatelliteState::Stopping),
            0x0E => Some(SatelliteState::Interrupting),
            _ => None,
        }
    }

    pub fn is_steady(self) -> bool {
        !self.is_transitional()
    }

    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            SatelliteState::Initializing
                | SatelliteState::Launching
                | SatelliteState::Landing
                | SatelliteState::Reconfiguring
                | SatelliteState::Starting
                | SatelliteState::Stopping
                | SatelliteState::Interrupting
        )
    }

    /// The steady state this transitional state completes to.
    pub fn completion_target(self) -> Option<SatelliteState> {
        if !self.is_transitional() {
            return None;
        }
        SatelliteState::from_u8((self as u8 & 0x0F) << 4)
    }

    /// Whether this transitional state targets `state`.
    pub fn transitions_to(self, state: SatelliteState) -> bool {
        ((self as u8 & 0x0F) << 4) == state as u8
    }

    /// State name as spoken on the control channel: steady states upper
    /// case, transitional states lower case.
    pub fn name(self) -> &'static str {
        match self {
            SatelliteState::New => "NEW",
            SatelliteState::Init => "INIT",
            SatelliteState::Orbit => "ORBIT",
            SatelliteState::Run => "RUN",
            SatelliteState::Safe => "SAFE",
            SatelliteState::Error => "ERROR",
            SatelliteState::Dead => "DEAD",
            SatelliteState::Initializing => "initializing",
            SatelliteState::Launching => "launching",
            SatelliteState::Landing => "landing",
            SatelliteState::Reconfiguring => "reconfiguring",
            SatelliteState::Starting => "starting",
            SatelliteState::Stopping => "stopping",
            SatelliteState::Interrupting => "interrupting",
        }
    }
}

/// Commands that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Initialize,
    Launch,
    Land,
    Start,
    Stop,
    Reconfigure,
    Interrupt,
    Failure,
    Shutdown,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Initialize => "initialize",
            Transition::Launch => "launch",
            Transition::Land => "land",
            Transition::Start => "start",
            Transition::Stop => "stop",
            Transition::Reconfigure => "reconfigure",
            Transition::Interrupt => "interrupt",
            Transition::Failure => "failure",
            Transition::Shutdown => "shutdown",
        }
    }

    /// The state this transition enters when legal from `from`.
    fn target_from(self, from: SatelliteState) -> Option<SatelliteState> {
        use SatelliteState::{
            Dead, Error, Init, Initializing, Interrupting, Landing, Launching, New, Orbit,
            Reconfiguring, Run, Safe, Starting, Stopping,
        };
        match self {
            Transition::Initialize => match from {
                New | Init | Error | Safe => Some(Initializing),
                _ => None,
            },
            Transition::Launch => (from == Init).then_some(Launching),
            Transition::Land => (from == Orbit).then_some(Landing),
            Transition::Start => (from == Orbit).then_some(Starting),
            Transition::Stop => (from == Run).then_some(Stopping),
            Transition::Reconfigure => (from == Orbit).then_some(Reconfiguring),
            Transition::Interrupt => match from {
                Orbit | Run => Some(Interrupting),
                _ => None,
            },
            Transition::Failure => (from != Dead).then_some(Error),
            Transition::Shutdown => match from {
                Init | Error | Safe => Some(Dead),
                _ => None,
            },
        }
    }
}

/// Manage the satellite's state and its transitions.
pub struct SatelliteFsm {
    state: AtomicU8,
    status: Mutex<String>,
    last_changed: Mutex<DateTime<Utc>>,
    /// Finished-transition latch, consumed by the heartbeat sender.
    transitioned: AtomicBool,
}

impl Default for SatelliteFsm {
    fn default() -> Self {
        SatelliteFsm::new()
    }
}

impl SatelliteFsm {
    pub fn new() -> SatelliteFsm {
        SatelliteFsm {
            state: AtomicU8::new(SatelliteState::New as u8),
            status: Mutex::new("Satellite not initialized yet.".to_owned()),
            last_changed: Mutex::new(Utc::now()),
            transitioned: AtomicBool::new(false),
        }
    }

    /// Current state, as an atomic load.
    pub fn state(&self) -> SatelliteState {
        // The atomic only ever holds values written from SatelliteState.
        SatelliteState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SatelliteState::Error)
    }

    /// Current status text.
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    /// Timestamp of the last state change.
    pub fn last_changed(&self) -> DateTime<Utc> {
        *self.last_changed.lock()
    }

    /// Consume the finished-transition latch.
    pub fn take_transitioned(&self) -> bool {
        self.transitioned.swap(false, Ordering::AcqRel)
    }

    /// Apply a transition, or fail if it is not legal in the current state.
    pub fn react(
        &self,
        transition: Transition,
        status: impl Into<String>,
    ) -> Result<SatelliteState, SatelliteError> {
        // The status lock serialises all transitions; reads stay atomic.
        let mut status_guard = self.status.lock();
        let from = SatelliteState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SatelliteState::Error);
        let target =
            transition
                .target_from(from)
                .ok_or(SatelliteError::TransitionNotAllowed {
                    transition: transition.name(),
                    state: from.name(),
                })?;
        *status_guard = status.into();
        self.enter(target);
        Ok(target)
    }

    /// Advance a transitional state to its steady target.
    ///
    /// In a steady state this only updates the status text, mirroring a
    /// completed threaded transition that was overtaken by stop/interrupt.
    pub fn complete(&self, status: impl Into<String>) -> SatelliteState {
        let mut status_guard = self.status.lock();
        let from = SatelliteState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SatelliteState::Error);
        match from.completion_target() {
            Some(target) => {
                log::info!(
                    "[fsm] state transition to steady state completed ({} -> {})",
                    from.name(),
                    target.name()
                );
                *status_guard = status.into();
                self.enter(target);
                target
            }
            None => {
                if from != SatelliteState::Error {
                    *status_guard = status.into();
                }
                from
            }
        }
    }

    /// Store the target state; caller holds the status lock.
    fn enter(&self, target: SatelliteState) {
        self.state.store(target as u8, Ordering::Release);
        *self.last_changed.lock() = Utc::now();
        self.transitioned.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(fsm: &SatelliteFsm, transition: Transition) -> SatelliteState {
        fsm.react(transition, transition.name()).unwrap()
    }

    #[test]
    fn nominal_cycle() {
        let fsm = SatelliteFsm::new();
        assert_eq!(fsm.state(), SatelliteState::New);

        assert_eq!(
            drive(&fsm, Transition::Initialize),
            SatelliteState::Initializing
        );
        assert!(fsm.take_transitioned());
        assert_eq!(fsm.complete("Initialized."), SatelliteState::Init);

        drive(&fsm, Transition::Launch);
        assert_eq!(fsm.complete("Launched."), SatelliteState::Orbit);

        drive(&fsm, Transition::Start);
        assert_eq!(fsm.complete("Started."), SatelliteState::Run);

        drive(&fsm, Transition::Stop);
        assert_eq!(fsm.complete("Stopped."), SatelliteState::Orbit);

        drive(&fsm, Transition::Land);
        assert_eq!(fsm.complete("Landed."), SatelliteState::Init);

        drive(&fsm, Transition::Shutdown);
        assert_eq!(fsm.state(), SatelliteState::Dead);
    }

    #[test]
    fn transitional_states_reject_new_transitions() {
        let fsm = SatelliteFsm::new();
        drive(&fsm, Transition::Initialize);
        let err = fsm.react(Transition::Launch, "nope").unwrap_err();
        assert!(matches!(
            err,
            SatelliteError::TransitionNotAllowed { .. }
        ));
        assert_eq!(fsm.state(), SatelliteState::Initializing);
    }

    #[test]
    fn failure_from_everywhere_but_dead() {
        for state in [
            SatelliteState::New,
            SatelliteState::Starting,
            SatelliteState::Run,
            SatelliteState::Safe,
            SatelliteState::Error,
        ] {
            let fsm = SatelliteFsm::new();
            fsm.state.store(state as u8, Ordering::Release);
            assert_eq!(drive(&fsm, Transition::Failure), SatelliteState::Error);
        }
        let fsm = SatelliteFsm::new();
        fsm.state
            .store(SatelliteState::Dead as u8, Ordering::Release);
        assert!(fsm.react(Transition::Failure, "nope").is_err());
    }

    #[test]
    fn interrupt_reaches_safe() {
        let fsm = SatelliteFsm::new();
        drive(&fsm, Transition::Initialize);
        fsm.complete("ok");
        drive(&fsm, Transition::Launch);
        fsm.complete("ok");
        drive(&fsm, Transition::Interrupt);
        assert_eq!(fsm.state(), SatelliteState::Interrupting);
        assert_eq!(fsm.complete("Interrupted."), SatelliteState::Safe);
        // SAFE recovers via initialize.
        drive(&fsm, Transition::Initialize);
        assert_eq!(fsm.complete("ok"), SatelliteState::Init);
    }

    #[test]
    fn complete_in_steady_state_only_updates_status() {
        let fsm = SatelliteFsm::new();
        drive(&fsm, Transition::Initialize);
        fsm.complete("Initialized.");
        assert_eq!(fsm.complete("Run finished."), SatelliteState::Init);
        assert_eq!(fsm.status(), "Run finished.");
    }

    #[test]
    fn nibble_encoding_names_targets() {
        assert!(SatelliteState::Initializing.transitions_to(SatelliteState::Init));
        assert!(SatelliteState::Launching.transitions_to(SatelliteState::Orbit));
        assert!(SatelliteState::Landing.transitions_to(SatelliteState::Init));
        assert!(SatelliteState::Starting.transitions_to(SatelliteState::Run));
        assert!(SatelliteState::Stopping.transitions_to(SatelliteState::Orbit));
        assert!(SatelliteState::Interrupting.transitions_to(SatelliteState::Safe));
        assert!(!SatelliteState::Launching.transitions_to(SatelliteState::Run));
    }

    #[test]
    fn reconfigure_returns_to_orbit() {
        let fsm = SatelliteFsm::new();
        drive(&fsm, Transition::Initialize);
        fsm.complete("ok");
        drive(&fsm, Transition::Launch);
        fsm.complete("ok");
        drive(&fsm, Transition::Reconfigure);
        assert_eq!(fsm.complete("Reconfigured."), SatelliteState::Orbit);
    }
}
