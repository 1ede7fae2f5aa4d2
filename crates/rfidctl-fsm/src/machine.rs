//! The state machine runtime.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rfidctl_core::{ActionPhase, Error, Result};
use tracing::{debug, trace};

use crate::state::{State, StateGraph, StateId};
use crate::transition::{Action, ActionContext, GuardContext, StateConnection};

/// State machine walking a shared [`StateGraph`].
///
/// Keeps the current state, a FIFO of events still to be processed, and a
/// bounded history of traversed connections (oldest evicted first).
///
/// # Thread Safety
///
/// `fire` takes `&mut self`; a machine shared between tasks must be wrapped
/// in a mutex by its owner.
pub struct Fsm<E, C> {
    name: String,
    graph: Arc<StateGraph<E, C>>,
    initial: StateId,
    current: StateId,
    queue: VecDeque<E>,
    firing: bool,
    history: VecDeque<Arc<StateConnection<E, C>>>,
    max_history_size: usize,
}

impl<E, C> Fsm<E, C>
where
    E: PartialEq + fmt::Debug,
{
    /// Create a machine in `initial` and run its entry actions.
    ///
    /// The entry actions see neither a source state nor an event.
    ///
    /// # Errors
    ///
    /// Returns `Error::Construction` if `initial` is not part of `graph`, or
    /// `Error::ActionExecution` if an entry action fails.
    pub fn new(
        name: impl Into<String>,
        graph: Arc<StateGraph<E, C>>,
        initial: StateId,
        max_history_size: usize,
        context: &mut C,
    ) -> Result<Self> {
        let mut fsm = Self::build(name.into(), graph, initial, max_history_size)?;

        let graph = Arc::clone(&fsm.graph);
        let state = graph.state(initial)?;
        Self::run_actions(
            state.entry_actions(),
            ActionPhase::Entry,
            &graph.path(initial),
            context,
            None,
            None,
            &mut fsm.queue,
        )?;

        // Events raised by the initial entry actions.
        if !fsm.queue.is_empty() {
            fsm.firing = true;
            let result = fsm.drain(context);
            fsm.firing = false;
            result?;
        }

        Ok(fsm)
    }

    /// Resume from an existing history.
    ///
    /// The last entry's destination becomes both the initial and the current
    /// state. The entries are moved out of `history` (it is left empty) and
    /// trimmed to `max_history_size`. No actions run.
    ///
    /// # Errors
    ///
    /// Returns `Error::Construction` if `history` is empty or its last
    /// destination is not part of `graph`.
    pub fn from_history(
        name: impl Into<String>,
        graph: Arc<StateGraph<E, C>>,
        history: &mut VecDeque<Arc<StateConnection<E, C>>>,
        max_history_size: usize,
    ) -> Result<Self> {
        let Some(last) = history.back() else {
            return Err(Error::construction("history must not be empty"));
        };

        let mut fsm = Self::build(name.into(), graph, last.destination(), max_history_size)?;
        fsm.history = std::mem::take(history);
        fsm.trim_history();
        Ok(fsm)
    }

    fn build(
        name: String,
        graph: Arc<StateGraph<E, C>>,
        initial: StateId,
        max_history_size: usize,
    ) -> Result<Self> {
        graph.state(initial)?;
        Ok(Self {
            name,
            graph,
            initial,
            current: initial,
            queue: VecDeque::new(),
            firing: false,
            history: VecDeque::with_capacity(max_history_size.min(1024)),
            max_history_size,
        })
    }

    /// Process `event` and every event it causes to be raised.
    ///
    /// An event with no matching connection in the current state is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Error::GuardEvaluation` or `Error::ActionExecution`. Events
    /// queued behind the failing one stay queued and are processed by the
    /// next call.
    pub fn fire(&mut self, event: E, context: &mut C) -> Result<()> {
        self.queue.push_back(event);
        if self.firing {
            return Ok(());
        }

        self.firing = true;
        let result = self.drain(context);
        self.firing = false;
        result
    }

    fn drain(&mut self, context: &mut C) -> Result<()> {
        let graph = Arc::clone(&self.graph);

        while let Some(event) = self.queue.pop_front() {
            let source = graph.state(self.current)?;

            let Some(connection) = Self::select(source, &event, context)? else {
                trace!(
                    fsm = %self.name,
                    state = %graph.path(source.id()),
                    event = ?event,
                    "No connection for event, dropped"
                );
                continue;
            };

            let source_path = graph.path(source.id());
            Self::run_actions(
                source.exit_actions(),
                ActionPhase::Exit,
                &source_path,
                context,
                Some(source),
                Some(&event),
                &mut self.queue,
            )?;
            Self::run_actions(
                connection.transition().actions(),
                ActionPhase::Transition,
                connection.transition().name(),
                context,
                Some(source),
                Some(&event),
                &mut self.queue,
            )?;

            let destination = graph.state(connection.destination())?;
            let destination_path = graph.path(destination.id());
            self.current = destination.id();
            self.record(Arc::clone(connection));

            debug!(
                fsm = %self.name,
                from = %source_path,
                to = %destination_path,
                transition = connection.transition().name(),
                event = ?event,
                "State transition"
            );

            Self::run_actions(
                destination.entry_actions(),
                ActionPhase::Entry,
                &destination_path,
                context,
                Some(source),
                Some(&event),
                &mut self.queue,
            )?;
        }

        Ok(())
    }

    /// First connection of `source` whose event matches and whose guards all pass.
    fn select<'g>(
        source: &'g State<E, C>,
        event: &E,
        context: &C,
    ) -> Result<Option<&'g Arc<StateConnection<E, C>>>> {
        let ctx = GuardContext {
            source,
            event,
            context,
        };

        'connections: for connection in source.connections() {
            if connection.event() != event {
                continue;
            }
            for guard in connection.transition().guards() {
                match guard.evaluate(&ctx) {
                    Ok(true) => {}
                    Ok(false) => continue 'connections,
                    Err(err) => {
                        return Err(Error::GuardEvaluation {
                            transition: connection.transition().name().to_string(),
                            source: err,
                        });
                    }
                }
            }
            return Ok(Some(connection));
        }

        Ok(None)
    }

    fn run_actions(
        actions: &[Arc<dyn Action<E, C>>],
        phase: ActionPhase,
        subject: &str,
        context: &mut C,
        source: Option<&State<E, C>>,
        event: Option<&E>,
        raised: &mut VecDeque<E>,
    ) -> Result<()> {
        for action in actions {
            let mut ctx = ActionContext::new(&mut *context, source, event, &mut *raised);
            action
                .execute(&mut ctx)
                .map_err(|err| Error::ActionExecution {
                    phase,
                    subject: subject.to_string(),
                    source: err,
                })?;
        }
        Ok(())
    }

    fn record(&mut self, connection: Arc<StateConnection<E, C>>) {
        if self.max_history_size == 0 {
            return;
        }
        if self.history.len() >= self.max_history_size {
            self.history.pop_front();
        }
        self.history.push_back(connection);
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
    }
}

impl<E, C> Fsm<E, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<StateGraph<E, C>> {
        &self.graph
    }

    pub fn initial_state_id(&self) -> StateId {
        self.initial
    }

    pub fn current_state_id(&self) -> StateId {
        self.current
    }

    /// Get the current state of the machine.
    pub fn current_state(&self) -> &State<E, C> {
        // `current` is only ever assigned ids validated against `graph`.
        self.graph.get(self.current)
    }

    pub fn initial_state(&self) -> &State<E, C> {
        self.graph.get(self.initial)
    }

    /// Traversed connections, oldest first.
    pub fn history(&self) -> &VecDeque<Arc<StateConnection<E, C>>> {
        &self.history
    }

    /// Get the last `count` traversed connections, oldest first.
    pub fn last_transitions(&self, count: usize) -> Vec<Arc<StateConnection<E, C>>> {
        let skip = self.history.len().saturating_sub(count);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    /// Change the history bound, evicting the oldest entries immediately.
    pub fn set_max_history_size(&mut self, max_history_size: usize) {
        self.max_history_size = max_history_size;
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Whether a `fire` call is currently draining the queue.
    pub fn is_firing(&self) -> bool {
        self.firing
    }

    /// Events queued but not yet processed (non-zero only after a failed `fire`).
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }
}

impl<E, C> fmt::Debug for Fsm<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("name", &self.name)
            .field("current", &self.graph.path(self.current))
            .field("pending", &self.queue.len())
            .field("history", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::Transition;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Ev {
        Next,
        Back,
        Ping,
        Chain,
    }

    #[derive(Default)]
    struct Ctx {
        log: Vec<String>,
        allow: bool,
        fail: Option<&'static str>,
    }

    type Hook = std::result::Result<(), rfidctl_core::BoxError>;

    fn logging(tag: &'static str) -> impl Fn(&mut ActionContext<'_, Ev, Ctx>) -> Hook {
        move |ctx| {
            if ctx.context.fail == Some(tag) {
                return Err(format!("{tag} failed").into());
            }
            ctx.context.log.push(tag.to_string());
            Ok(())
        }
    }

    /// `s1 --Next--> s2 --Back--> s1`, with logging on every hook.
    fn ping_pong() -> (Arc<StateGraph<Ev, Ctx>>, StateId, StateId) {
        let mut graph = StateGraph::new();
        let s1 = graph.add_state("s1");
        let s2 = graph.add_state("s2");

        graph.on_entry(s1, logging("enter s1")).unwrap();
        graph.on_exit(s1, logging("exit s1")).unwrap();
        graph.on_entry(s2, logging("enter s2")).unwrap();
        graph.on_exit(s2, logging("exit s2")).unwrap();

        let next = Arc::new(Transition::new("next").with_action(logging("next")));
        let back = Arc::new(Transition::new("back").with_action(logging("back")));
        graph.connect(s1, Ev::Next, &next, s2).unwrap();
        graph.connect(s2, Ev::Back, &back, s1).unwrap();

        (Arc::new(graph), s1, s2)
    }

    #[test]
    fn test_new_runs_initial_entry_actions() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();

        let fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();

        assert_eq!(ctx.log, vec!["enter s1"]);
        assert_eq!(fsm.current_state_id(), s1);
        assert_eq!(fsm.initial_state().name(), "s1");
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn test_fire_runs_exit_transition_entry_in_order() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();
        ctx.log.clear();

        fsm.fire(Ev::Next, &mut ctx).unwrap();

        assert_eq!(ctx.log, vec!["exit s1", "next", "enter s2"]);
        assert_eq!(fsm.current_state().name(), "s2");
    }

    #[test]
    fn test_history_bounded_to_one() {
        let (graph, s1, s2) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 1, &mut ctx).unwrap();

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        assert_eq!(fsm.history().len(), 1);
        assert_eq!(fsm.history()[0].destination(), s2);

        fsm.fire(Ev::Back, &mut ctx).unwrap();
        assert_eq!(fsm.history().len(), 1);
        assert_eq!(fsm.history()[0].destination(), s1);
        assert_eq!(fsm.history()[0].transition().name(), "back");
    }

    #[test]
    fn test_same_event_round_trip_with_history_of_one() {
        let mut graph = StateGraph::new();
        let s1 = graph.add_state("s1");
        let s2 = graph.add_state("s2");
        let toggle = Arc::new(Transition::new("toggle"));
        graph.connect(s1, Ev::Next, &toggle, s2).unwrap();
        graph.connect(s2, Ev::Next, &toggle, s1).unwrap();

        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", Arc::new(graph), s1, 1, &mut ctx).unwrap();

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        assert_eq!(fsm.current_state_id(), s2);
        assert_eq!(fsm.history().len(), 1);
        assert_eq!(fsm.history()[0].destination(), s2);

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        assert_eq!(fsm.current_state_id(), s1);
        assert_eq!(fsm.history().len(), 1);
        assert_eq!(fsm.history()[0].source(), s2);
        assert_eq!(fsm.history()[0].destination(), s1);
    }

    #[test]
    fn test_zero_history_records_nothing() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 3, &mut ctx).unwrap();

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        fsm.fire(Ev::Back, &mut ctx).unwrap();
        assert_eq!(fsm.history().len(), 2);

        fsm.set_max_history_size(0);
        assert!(fsm.history().is_empty());

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        assert!(fsm.history().is_empty());
        assert_eq!(fsm.current_state().name(), "s2");
    }

    #[test]
    fn test_last_transitions_and_clear() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        fsm.fire(Ev::Back, &mut ctx).unwrap();
        fsm.fire(Ev::Next, &mut ctx).unwrap();

        let last = fsm.last_transitions(2);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].transition().name(), "back");
        assert_eq!(last[1].transition().name(), "next");
        assert_eq!(fsm.last_transitions(10).len(), 3);

        fsm.clear_history();
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn test_unmatched_event_is_dropped() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();
        ctx.log.clear();

        fsm.fire(Ev::Back, &mut ctx).unwrap();

        assert_eq!(fsm.current_state().name(), "s1");
        assert!(ctx.log.is_empty());
        assert!(fsm.history().is_empty());
        assert_eq!(fsm.pending_events(), 0);
    }

    #[test]
    fn test_guard_blocks_until_true() {
        let mut graph = StateGraph::new();
        let closed = graph.add_state("closed");
        let open = graph.add_state("open");
        let gated = Arc::new(
            Transition::<Ev, Ctx>::new("gated").with_guard(|ctx| Ok(ctx.context.allow)),
        );
        graph.connect(closed, Ev::Next, &gated, open).unwrap();

        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", Arc::new(graph), closed, 10, &mut ctx).unwrap();

        fsm.fire(Ev::Next, &mut ctx).unwrap();
        assert_eq!(fsm.current_state().name(), "closed");

        ctx.allow = true;
        fsm.fire(Ev::Next, &mut ctx).unwrap();
        assert_eq!(fsm.current_state().name(), "open");
    }

    #[test]
    fn test_first_passing_connection_wins() {
        let mut graph = StateGraph::new();
        let start = graph.add_state("start");
        let left = graph.add_state("left");
        let right = graph.add_state("right");
        let blocked = Arc::new(
            Transition::<Ev, Ctx>::new("blocked").with_guard(|ctx| Ok(ctx.context.allow)),
        );
        graph.connect(start, Ev::Next, &blocked, left).unwrap();
        graph
            .connect(start, Ev::Next, &Arc::new(Transition::new("open")), right)
            .unwrap();

        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", Arc::new(graph), start, 10, &mut ctx).unwrap();
        fsm.fire(Ev::Next, &mut ctx).unwrap();

        assert_eq!(fsm.current_state().name(), "right");
    }

    #[test]
    fn test_guard_error_is_reported() {
        let mut graph = StateGraph::new();
        let a = graph.add_state("a");
        let b = graph.add_state("b");
        let broken = Arc::new(
            Transition::<Ev, Ctx>::new("broken").with_guard(|_| Err("sensor offline".into())),
        );
        graph.connect(a, Ev::Next, &broken, b).unwrap();

        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", Arc::new(graph), a, 10, &mut ctx).unwrap();
        let err = fsm.fire(Ev::Next, &mut ctx).unwrap_err();

        assert!(matches!(err, Error::GuardEvaluation { ref transition, .. } if transition == "broken"));
        assert_eq!(fsm.current_state().name(), "a");
    }

    #[test]
    fn test_failing_exit_action_keeps_state() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();
        ctx.fail = Some("exit s1");

        let err = fsm.fire(Ev::Next, &mut ctx).unwrap_err();

        assert!(matches!(
            err,
            Error::ActionExecution { phase: ActionPhase::Exit, ref subject, .. } if subject == "s1"
        ));
        assert_eq!(fsm.current_state().name(), "s1");
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn test_failing_transition_action_keeps_state() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();
        ctx.fail = Some("next");

        let err = fsm.fire(Ev::Next, &mut ctx).unwrap_err();

        assert!(matches!(
            err,
            Error::ActionExecution { phase: ActionPhase::Transition, ref subject, .. } if subject == "next"
        ));
        assert_eq!(fsm.current_state().name(), "s1");
    }

    #[test]
    fn test_failing_entry_action_commits_transition() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", graph, s1, 10, &mut ctx).unwrap();
        ctx.fail = Some("enter s2");

        let err = fsm.fire(Ev::Next, &mut ctx).unwrap_err();

        assert!(matches!(err, Error::ActionExecution { phase: ActionPhase::Entry, .. }));
        assert_eq!(fsm.current_state().name(), "s2");
        assert_eq!(fsm.history().len(), 1);
    }

    #[test]
    fn test_failing_initial_entry_fails_construction() {
        let (graph, s1, _) = ping_pong();
        let mut ctx = Ctx {
            fail: Some("enter s1"),
            ..Ctx::default()
        };

        assert!(Fsm::new("t", graph, s1, 10, &mut ctx).is_err());
    }

    #[test]
    fn test_raised_events_run_in_the_same_fire() {
        let mut graph = StateGraph::new();
        let a = graph.add_state("a");
        let b = graph.add_state("b");
        let c = graph.add_state("c");
        let chain = Arc::new(Transition::<Ev, Ctx>::new("chain").with_action(|ctx| {
            ctx.raise(Ev::Next);
            ctx.raise(Ev::Ping);
            Ok(())
        }));
        graph.connect(a, Ev::Chain, &chain, b).unwrap();
        graph
            .connect(b, Ev::Next, &Arc::new(Transition::new("b-next")), c)
            .unwrap();

        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", Arc::new(graph), a, 10, &mut ctx).unwrap();
        fsm.fire(Ev::Chain, &mut ctx).unwrap();

        // Ping has no connection from `c` and is dropped.
        assert_eq!(fsm.current_state().name(), "c");
        assert_eq!(fsm.history().len(), 2);
        assert_eq!(fsm.pending_events(), 0);
        assert!(!fsm.is_firing());
    }

    #[test]
    fn test_error_abandons_queued_events() {
        let mut graph = StateGraph::new();
        let a = graph.add_state("a");
        let b = graph.add_state("b");
        let raise_then_fail = Arc::new(Transition::<Ev, Ctx>::new("go").with_action(|ctx| {
            ctx.raise(Ev::Back);
            Ok(())
        }));
        graph.connect(a, Ev::Next, &raise_then_fail, b).unwrap();
        graph.on_entry(b, logging("enter b")).unwrap();
        graph
            .connect(b, Ev::Back, &Arc::new(Transition::new("back")), a)
            .unwrap();

        let mut ctx = Ctx {
            fail: Some("enter b"),
            ..Ctx::default()
        };
        let mut fsm = Fsm::new("t", Arc::new(graph), a, 10, &mut ctx).unwrap();

        assert!(fsm.fire(Ev::Next, &mut ctx).is_err());
        assert_eq!(fsm.current_state().name(), "b");
        assert_eq!(fsm.pending_events(), 1);

        // The stale Back is processed before the new event.
        ctx.fail = None;
        fsm.fire(Ev::Ping, &mut ctx).unwrap();
        assert_eq!(fsm.current_state().name(), "a");
        assert_eq!(fsm.pending_events(), 0);
    }

    #[test]
    fn test_from_history_resumes_at_last_destination() {
        let (graph, s1, s2) = ping_pong();
        let mut ctx = Ctx::default();
        let mut fsm = Fsm::new("t", Arc::clone(&graph), s1, 10, &mut ctx).unwrap();
        fsm.fire(Ev::Next, &mut ctx).unwrap();
        fsm.fire(Ev::Back, &mut ctx).unwrap();
        fsm.fire(Ev::Next, &mut ctx).unwrap();

        let mut history = fsm.history().clone();
        ctx.log.clear();
        let resumed = Fsm::from_history("resumed", graph, &mut history, 2).unwrap();

        assert!(history.is_empty());
        assert!(ctx.log.is_empty());
        assert_eq!(resumed.current_state_id(), s2);
        assert_eq!(resumed.initial_state_id(), s2);
        assert_eq!(resumed.history().len(), 2);
        assert_eq!(resumed.history()[0].transition().name(), "back");
    }

    #[test]
    fn test_from_history_rejects_empty_history() {
        let (graph, _, _) = ping_pong();
        let mut history = VecDeque::new();

        let err = Fsm::from_history("t", graph, &mut history, 10).unwrap_err();

        assert!(err.to_string().contains("history must not be empty"));
    }
}
