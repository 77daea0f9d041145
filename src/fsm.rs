//! Table driven state machine engine.
//!
//! Both the TEI manager and the layer 2 link are written as a list of
//! `(state, event, handler)` triples. The list is turned into a dense
//! dispatch table once, and every incoming event is looked up in it.
//! Handlers are plain enum values, so a machine implements [`Machine::call`]
//! with a `match` over its own handler enum.
//!
//! Timers are single shot slots owned by the machine. They never call back on
//! their own: the driver polls them with the current time, and a fired timer
//! hands its event back to be dispatched like any other event.
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::{debug, error, warn};

/// A state or event enum that can index a dispatch table.
pub trait Symbol: Copy + Debug {
    fn index(self) -> usize;
}

/// Something that owns an [`FsmInstance`] and knows how to run handlers.
pub trait Machine {
    type State: Symbol;
    type Event: Symbol;
    type Handler: Copy + Debug;
    type Arg;

    fn fsm(&self) -> &FsmInstance<Self::State>;

    /// Run one handler. The handler is expected to call
    /// [`FsmInstance::change_state`] itself if the event causes a transition.
    fn call(&mut self, handler: Self::Handler, event: Self::Event, arg: Self::Arg);
}

/// Immutable `(state, event) -> handler` table.
#[derive(Debug)]
pub struct FsmDefinition<S, E, H> {
    name: &'static str,
    states: usize,
    events: usize,
    table: Vec<Option<H>>,
    rejected: usize,
    _symbols: PhantomData<(S, E)>,
}

impl<S: Symbol, E: Symbol, H: Copy + Debug> FsmDefinition<S, E, H> {
    /// Build the table.
    ///
    /// Entries that name a state or event outside `states`/`events` are
    /// logged and skipped. They never touch other entries.
    pub fn build(name: &'static str, states: usize, events: usize, list: &[(S, E, H)]) -> Self {
        let mut table = vec![None; states * events];
        let mut rejected = 0;
        for &(state, event, handler) in list {
            let (s, e) = (state.index(), event.index());
            if s >= states || e >= events {
                error!(
                    "{name}: rejecting {state:?}/{event:?} -> {handler:?}: index {s}/{e} out of range {states}/{events}"
                );
                rejected += 1;
                continue;
            }
            if let Some(old) = table[s * events + e].replace(handler) {
                warn!("{name}: {state:?}/{event:?} registered twice, {old:?} replaced by {handler:?}");
            }
        }
        Self {
            name,
            states,
            events,
            table,
            rejected,
            _symbols: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of entries dropped by [`FsmDefinition::build`].
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Find the handler for a pair, if any.
    ///
    /// Out of range indices are a programming error, but are only logged.
    #[must_use]
    pub fn lookup(&self, state: S, event: E) -> Option<H> {
        let (s, e) = (state.index(), event.index());
        if s >= self.states || e >= self.events {
            error!(
                "{}: lookup of {state:?}/{event:?} out of range ({s}/{e})",
                self.name
            );
            return None;
        }
        self.table[s * self.events + e]
    }

    /// Dispatch an event to a machine.
    ///
    /// Returns true if a handler ran. An event without a handler in the
    /// current state is not an error, it is just traced.
    pub fn dispatch<M>(&self, machine: &mut M, event: E, arg: M::Arg) -> bool
    where
        M: Machine<State = S, Event = E, Handler = H>,
    {
        let state = machine.fsm().state();
        match self.lookup(state, event) {
            Some(handler) => {
                machine.fsm().trace(format_args!("{event:?} in {state:?}"));
                machine.call(handler, event, arg);
                true
            }
            None => {
                machine
                    .fsm()
                    .trace(format_args!("no handler for {event:?} in {state:?}"));
                false
            }
        }
    }
}

/// Runtime cursor of a machine.
#[derive(Debug, Clone)]
pub struct FsmInstance<S> {
    name: String,
    state: S,
    debug: bool,
}

impl<S: Symbol> FsmInstance<S> {
    pub fn new(name: impl Into<String>, initial: S) -> Self {
        Self {
            name: name.into(),
            state: initial,
            debug: true,
        }
    }

    #[must_use]
    pub fn state(&self) -> S {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Turn the debug sink on or off.
    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    pub fn change_state(&mut self, new: S) {
        self.trace(format_args!("state {:?} -> {new:?}", self.state));
        self.state = new;
    }

    pub fn trace(&self, args: std::fmt::Arguments<'_>) {
        if self.debug {
            debug!("{}: {args}", self.name);
        }
    }
}

/// Single shot timer slot.
///
/// A slot is either disarmed, or armed with a deadline and the event it will
/// deliver. It has to be disarmed (or fired) before it can be armed again.
#[derive(Debug, Clone)]
pub struct Timer<E> {
    name: &'static str,
    armed: Option<(Instant, E)>,
}

impl<E: Copy + Debug> Timer<E> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self { name, armed: None }
    }

    pub fn arm(&mut self, now: Instant, delay: Duration, event: E) -> Result<()> {
        if let Some((_, pending)) = &self.armed {
            bail!("timer {} already armed with {pending:?}", self.name);
        }
        self.armed = Some((now + delay, event));
        Ok(())
    }

    /// Cancel the timer. Returns whether it was armed.
    pub fn disarm(&mut self) -> bool {
        self.armed.take().is_some()
    }

    pub fn restart(&mut self, now: Instant, delay: Duration, event: E) {
        self.armed = Some((now + delay, event));
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Take the event out of an expired timer.
    pub fn fire(&mut self, now: Instant) -> Option<E> {
        match self.armed {
            Some((deadline, event)) if deadline <= now => {
                self.armed = None;
                Some(event)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|(deadline, _)| deadline)
    }

    /// Time left until the timer fires, `None` if disarmed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum St {
        Off,
        On,
    }

    impl Symbol for St {
        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Ev {
        Push,
        Pull,
        Kick,
    }

    impl Symbol for Ev {
        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Hd {
        TurnOn,
        TurnOff,
        Noop,
    }

    struct Lamp {
        fsm: FsmInstance<St>,
        calls: Vec<(Hd, Ev, u32)>,
    }

    impl Machine for Lamp {
        type State = St;
        type Event = Ev;
        type Handler = Hd;
        type Arg = u32;

        fn fsm(&self) -> &FsmInstance<St> {
            &self.fsm
        }

        fn call(&mut self, handler: Hd, event: Ev, arg: u32) {
            self.calls.push((handler, event, arg));
            match handler {
                Hd::TurnOn => self.fsm.change_state(St::On),
                Hd::TurnOff => self.fsm.change_state(St::Off),
                Hd::Noop => {}
            }
        }
    }

    fn lamp() -> Lamp {
        Lamp {
            fsm: FsmInstance::new("lamp", St::Off),
            calls: Vec::new(),
        }
    }

    fn definition() -> FsmDefinition<St, Ev, Hd> {
        FsmDefinition::build(
            "lamp",
            2,
            3,
            &[
                (St::Off, Ev::Push, Hd::TurnOn),
                (St::On, Ev::Pull, Hd::TurnOff),
                (St::On, Ev::Push, Hd::Noop),
            ],
        )
    }

    #[test]
    fn registered_handler_runs_once() {
        let def = definition();
        let mut l = lamp();
        assert!(def.dispatch(&mut l, Ev::Push, 7));
        assert_eq!(l.calls, vec![(Hd::TurnOn, Ev::Push, 7)]);
        assert_eq!(l.fsm.state(), St::On);

        assert!(def.dispatch(&mut l, Ev::Push, 8));
        assert_eq!(l.calls.len(), 2);
        assert_eq!(l.calls[1], (Hd::Noop, Ev::Push, 8));
        assert_eq!(l.fsm.state(), St::On);
    }

    #[test]
    fn unregistered_pair_is_noop() {
        let def = definition();
        let mut l = lamp();
        assert!(!def.dispatch(&mut l, Ev::Pull, 1));
        assert!(!def.dispatch(&mut l, Ev::Kick, 1));
        assert!(l.calls.is_empty());
        assert_eq!(l.fsm.state(), St::Off);
    }

    #[derive(Debug, Clone, Copy)]
    struct Raw(usize);

    impl Symbol for Raw {
        fn index(self) -> usize {
            self.0
        }
    }

    #[test]
    fn out_of_range_entries_rejected() {
        let def: FsmDefinition<Raw, Raw, u8> = FsmDefinition::build(
            "raw",
            2,
            2,
            &[
                (Raw(0), Raw(0), 1),
                (Raw(2), Raw(0), 2),
                (Raw(0), Raw(5), 3),
                (Raw(1), Raw(1), 4),
            ],
        );
        assert_eq!(def.rejected(), 2);
        assert_eq!(def.lookup(Raw(0), Raw(0)), Some(1));
        assert_eq!(def.lookup(Raw(1), Raw(1)), Some(4));
        assert_eq!(def.lookup(Raw(1), Raw(0)), None);
        assert_eq!(def.lookup(Raw(0), Raw(1)), None);
        assert_eq!(def.lookup(Raw(9), Raw(0)), None);
        assert_eq!(def.lookup(Raw(0), Raw(9)), None);
    }

    #[test]
    fn timer_arm_twice_fails() -> Result<()> {
        let now = Instant::now();
        let mut t = Timer::new("t");
        t.arm(now, Duration::from_millis(10), Ev::Kick)?;
        assert!(t.arm(now, Duration::from_millis(10), Ev::Kick).is_err());
        assert!(t.disarm());
        assert!(!t.disarm());
        t.arm(now, Duration::from_millis(10), Ev::Pull)?;
        assert_eq!(t.remaining(now), Some(Duration::from_millis(10)));
        Ok(())
    }

    #[test]
    fn timer_fires_once() -> Result<()> {
        let now = Instant::now();
        let mut t = Timer::new("t");
        assert_eq!(t.fire(now), None);
        t.arm(now, Duration::from_millis(10), Ev::Kick)?;
        assert_eq!(t.fire(now + Duration::from_millis(9)), None);
        assert_eq!(t.fire(now + Duration::from_millis(10)), Some(Ev::Kick));
        assert_eq!(t.fire(now + Duration::from_millis(20)), None);
        assert!(!t.is_armed());

        t.arm(now, Duration::from_millis(10), Ev::Kick)?;
        t.restart(now, Duration::from_millis(30), Ev::Push);
        assert_eq!(t.fire(now + Duration::from_millis(10)), None);
        assert_eq!(t.fire(now + Duration::from_millis(30)), Some(Ev::Push));
        Ok(())
    }
}
