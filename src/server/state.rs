//! Launch state machine.
//!
//! [`LaunchMachine::transition`] is pure: it maps a state and an observed
//! event to the next state and the effect the runner must perform. All I/O
//! lives in the runner, so retry budgets and plugin fallbacks are tested
//! without processes.

use crate::options::AuxProtocol;

use super::signature::Signal;

/// Where a launch currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Start,
    Bootstrap(Attempt),
    Spawn(Attempt),
    PortConflict(Attempt),
    Ready,
    ExitedEarly,
    Failed,
}

/// Retry bookkeeping carried between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Attempt {
    /// Conflicts seen so far.
    pub(crate) retries_used: u32,
    /// Whether the X plugin is enabled for the next spawn.
    pub(crate) aux_enabled: bool,
}

/// Something the runner observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Begin,
    BootstrapSucceeded,
    Detected(Signal),
    Exited,
    TimedOut,
    WorkspaceReset,
}

/// Work the runner performs before reporting the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Initialise the data directory.
    RunBootstrap,
    /// Pick ports and start the server.
    Spawn { aux_enabled: bool },
    /// Stop the server (forcibly when `kill`) and wipe the data directory.
    ResetForRetry { kill: bool },
    /// Hand the running server to the caller.
    Resolve,
    /// Stop the server and surface an error.
    Fail(Failure),
}

/// Terminal failure reported by [`Effect::Fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    PortConflictExhausted { attempts: u32, aux: bool },
    EarlyExit,
    StartupTimeout,
    /// An event arrived that the current state cannot produce.
    Unexpected { state: State, event: Event },
}

/// Transition table configured with the caller's retry budget.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LaunchMachine {
    port_retries: u32,
    aux: AuxProtocol,
}

impl LaunchMachine {
    pub(crate) const fn new(port_retries: u32, aux: AuxProtocol) -> Self {
        Self { port_retries, aux }
    }

    pub(crate) fn transition(self, state: State, event: Event) -> (State, Effect) {
        match (state, event) {
            (State::Start, Event::Begin) => {
                let attempt = Attempt {
                    retries_used: 0,
                    aux_enabled: self.aux != AuxProtocol::Off,
                };
                (State::Bootstrap(attempt), Effect::RunBootstrap)
            }
            (State::Bootstrap(attempt), Event::BootstrapSucceeded) => (
                State::Spawn(attempt),
                Effect::Spawn {
                    aux_enabled: attempt.aux_enabled,
                },
            ),
            (State::Spawn(_), Event::Detected(Signal::Ready)) => (State::Ready, Effect::Resolve),
            (State::Spawn(attempt), Event::Detected(Signal::PortInUse)) => {
                self.on_conflict(attempt, false)
            }
            (State::Spawn(attempt), Event::Detected(Signal::AuxPortInUse)) => {
                self.on_conflict(attempt, true)
            }
            (State::Spawn(_), Event::Exited) => {
                (State::ExitedEarly, Effect::Fail(Failure::EarlyExit))
            }
            (State::Spawn(_), Event::TimedOut) => {
                (State::Failed, Effect::Fail(Failure::StartupTimeout))
            }
            (State::PortConflict(attempt), Event::WorkspaceReset) => {
                (State::Bootstrap(attempt), Effect::RunBootstrap)
            }
            (state, event) => (
                State::Failed,
                Effect::Fail(Failure::Unexpected { state, event }),
            ),
        }
    }

    fn on_conflict(self, attempt: Attempt, aux: bool) -> (State, Effect) {
        if attempt.retries_used < self.port_retries {
            let next = Attempt {
                retries_used: attempt.retries_used + 1,
                ..attempt
            };
            return (State::PortConflict(next), Effect::ResetForRetry { kill: aux });
        }
        if aux && self.aux == AuxProtocol::On {
            // One last launch without the plugin; the budget stays spent.
            let next = Attempt {
                aux_enabled: false,
                ..attempt
            };
            return (State::PortConflict(next), Effect::ResetForRetry { kill: true });
        }
        (
            State::Failed,
            Effect::Fail(Failure::PortConflictExhausted {
                attempts: attempt.retries_used.saturating_add(1),
                aux,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn spawned(machine: LaunchMachine) -> State {
        let (state, _) = machine.transition(State::Start, Event::Begin);
        let (state, effect) = machine.transition(state, Event::BootstrapSucceeded);
        assert!(matches!(effect, Effect::Spawn { .. }));
        state
    }

    /// Drives one conflict through reset and re-bootstrap back to spawning.
    fn retry(machine: LaunchMachine, state: State, signal: Signal) -> (State, Effect) {
        let (state, effect) = machine.transition(state, Event::Detected(signal));
        if !matches!(effect, Effect::ResetForRetry { .. }) {
            return (state, effect);
        }
        let (state, effect) = machine.transition(state, Event::WorkspaceReset);
        assert_eq!(effect, Effect::RunBootstrap);
        machine.transition(state, Event::BootstrapSucceeded)
    }

    #[test]
    fn happy_path_reaches_ready() {
        let machine = LaunchMachine::new(3, AuxProtocol::Force);
        let (state, effect) = machine.transition(State::Start, Event::Begin);
        assert_eq!(effect, Effect::RunBootstrap);
        let (state, effect) = machine.transition(state, Event::BootstrapSucceeded);
        assert_eq!(effect, Effect::Spawn { aux_enabled: true });
        let (state, effect) = machine.transition(state, Event::Detected(Signal::Ready));
        assert_eq!((state, effect), (State::Ready, Effect::Resolve));
    }

    #[test]
    fn aux_off_spawns_without_plugin() {
        let machine = LaunchMachine::new(3, AuxProtocol::Off);
        let (state, _) = machine.transition(State::Start, Event::Begin);
        let (_, effect) = machine.transition(state, Event::BootstrapSucceeded);
        assert_eq!(effect, Effect::Spawn { aux_enabled: false });
    }

    #[test]
    fn zero_budget_fails_on_first_collision() {
        let machine = LaunchMachine::new(0, AuxProtocol::Force);
        let state = spawned(machine);

        let (state, effect) = machine.transition(state, Event::Detected(Signal::PortInUse));

        assert_eq!(state, State::Failed);
        assert_eq!(
            effect,
            Effect::Fail(Failure::PortConflictExhausted {
                attempts: 1,
                aux: false
            })
        );
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn primary_conflicts_retry_until_budget(#[case] budget: u32) {
        let machine = LaunchMachine::new(budget, AuxProtocol::Force);
        let mut state = spawned(machine);
        for _ in 0..budget {
            let (next, effect) = retry(machine, state, Signal::PortInUse);
            assert_eq!(effect, Effect::Spawn { aux_enabled: true });
            state = next;
        }
        let (_, effect) = machine.transition(state, Event::Detected(Signal::PortInUse));
        assert_eq!(
            effect,
            Effect::Fail(Failure::PortConflictExhausted {
                attempts: budget + 1,
                aux: false
            })
        );
    }

    #[test]
    fn aux_conflict_kills_before_retry() {
        let machine = LaunchMachine::new(2, AuxProtocol::Force);
        let state = spawned(machine);

        let (state, effect) = machine.transition(state, Event::Detected(Signal::AuxPortInUse));

        assert_eq!(effect, Effect::ResetForRetry { kill: true });
        assert!(matches!(state, State::PortConflict(Attempt { retries_used: 1, .. })));
    }

    #[test]
    fn aux_on_falls_back_to_plugin_free_launch() {
        let machine = LaunchMachine::new(1, AuxProtocol::On);
        let state = spawned(machine);
        let (state, effect) = retry(machine, state, Signal::AuxPortInUse);
        assert_eq!(effect, Effect::Spawn { aux_enabled: true });

        let (state, effect) = retry(machine, state, Signal::AuxPortInUse);
        assert_eq!(effect, Effect::Spawn { aux_enabled: false });

        let (_, effect) = machine.transition(state, Event::Detected(Signal::PortInUse));
        assert!(matches!(
            effect,
            Effect::Fail(Failure::PortConflictExhausted { aux: false, .. })
        ));
    }

    #[test]
    fn aux_force_fails_when_exhausted() {
        let machine = LaunchMachine::new(0, AuxProtocol::Force);
        let state = spawned(machine);

        let (_, effect) = machine.transition(state, Event::Detected(Signal::AuxPortInUse));

        assert_eq!(
            effect,
            Effect::Fail(Failure::PortConflictExhausted {
                attempts: 1,
                aux: true
            })
        );
    }

    #[rstest]
    #[case(Event::Exited, State::ExitedEarly, Failure::EarlyExit)]
    #[case(Event::TimedOut, State::Failed, Failure::StartupTimeout)]
    fn spawn_failures(#[case] event: Event, #[case] expected: State, #[case] failure: Failure) {
        let machine = LaunchMachine::new(3, AuxProtocol::Force);
        let state = spawned(machine);
        assert_eq!(
            machine.transition(state, event),
            (expected, Effect::Fail(failure))
        );
    }

    #[test]
    fn out_of_order_event_fails() {
        let machine = LaunchMachine::new(3, AuxProtocol::Force);
        let (state, effect) = machine.transition(State::Start, Event::Exited);
        assert_eq!(state, State::Failed);
        assert!(matches!(effect, Effect::Fail(Failure::Unexpected { .. })));
    }
}
