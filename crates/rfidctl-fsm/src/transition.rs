//! Transitions, connections, guards and actions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rfidctl_core::BoxError;

use crate::state::{State, StateId};

/// Inputs available to a guard.
pub struct GuardContext<'a, E, C> {
    /// State the machine is currently in.
    pub source: &'a State<E, C>,

    /// Event being processed.
    pub event: &'a E,

    /// Caller-owned context passed to `fire`.
    pub context: &'a C,
}

/// Predicate gating a transition.
///
/// Returning `Err` aborts the current `fire` call with
/// `Error::GuardEvaluation`; returning `Ok(false)` just blocks the transition.
pub trait Guard<E, C>: Send + Sync {
    fn evaluate(&self, ctx: &GuardContext<'_, E, C>) -> Result<bool, BoxError>;
}

impl<E, C, F> Guard<E, C> for F
where
    F: Fn(&GuardContext<'_, E, C>) -> Result<bool, BoxError> + Send + Sync,
{
    fn evaluate(&self, ctx: &GuardContext<'_, E, C>) -> Result<bool, BoxError> {
        self(ctx)
    }
}

/// Inputs available to an entry, exit or transition action.
pub struct ActionContext<'a, E, C> {
    /// Caller-owned context passed to `fire`.
    pub context: &'a mut C,
    source: Option<&'a State<E, C>>,
    event: Option<&'a E>,
    raised: &'a mut VecDeque<E>,
}

impl<'a, E, C> ActionContext<'a, E, C> {
    pub(crate) fn new(
        context: &'a mut C,
        source: Option<&'a State<E, C>>,
        event: Option<&'a E>,
        raised: &'a mut VecDeque<E>,
    ) -> Self {
        Self {
            context,
            source,
            event,
            raised,
        }
    }

    /// State the transition started from; `None` for the entry actions run
    /// when the machine is constructed.
    pub fn source(&self) -> Option<&'a State<E, C>> {
        self.source
    }

    /// Event that triggered the transition; `None` at construction.
    pub fn event(&self) -> Option<&'a E> {
        self.event
    }

    /// Queue a follow-up event on the machine running this action.
    ///
    /// It is processed after every event already queued, by the `fire`
    /// call that is currently executing.
    pub fn raise(&mut self, event: E) {
        self.raised.push_back(event);
    }
}

/// Side-effecting routine run on entry, exit or transition.
pub trait Action<E, C>: Send + Sync {
    fn execute(&self, ctx: &mut ActionContext<'_, E, C>) -> Result<(), BoxError>;
}

impl<E, C, F> Action<E, C> for F
where
    F: Fn(&mut ActionContext<'_, E, C>) -> Result<(), BoxError> + Send + Sync,
{
    fn execute(&self, ctx: &mut ActionContext<'_, E, C>) -> Result<(), BoxError> {
        self(ctx)
    }
}

/// Named list of guards and actions, shareable between connections.
///
/// # Examples
///
/// ```
/// use rfidctl_fsm::Transition;
///
/// struct Link {
///     up: bool,
/// }
///
/// let transition = Transition::<&str, Link>::new("keepalive")
///     .with_guard(|ctx| Ok(ctx.context.up))
///     .with_action(|ctx| {
///         ctx.raise("ack");
///         Ok(())
///     });
///
/// assert_eq!(transition.name(), "keepalive");
/// assert_eq!(transition.guards().len(), 1);
/// ```
pub struct Transition<E, C> {
    name: String,
    guards: Vec<Arc<dyn Guard<E, C>>>,
    actions: Vec<Arc<dyn Action<E, C>>>,
}

impl<E, C> Transition<E, C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guards: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Append a guard; all guards must pass, evaluated in order.
    #[must_use]
    pub fn with_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&GuardContext<'_, E, C>) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.guards.push(Arc::new(guard));
        self
    }

    /// Append a guard object shared with other transitions.
    #[must_use]
    pub fn with_shared_guard(mut self, guard: Arc<dyn Guard<E, C>>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Append an action; actions run in order once the guards pass.
    #[must_use]
    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ActionContext<'_, E, C>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(action));
        self
    }

    /// Append an action object shared with other transitions.
    #[must_use]
    pub fn with_shared_action(mut self, action: Arc<dyn Action<E, C>>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guards(&self) -> &[Arc<dyn Guard<E, C>>] {
        &self.guards
    }

    pub fn actions(&self) -> &[Arc<dyn Action<E, C>>] {
        &self.actions
    }
}

impl<E, C> fmt::Debug for Transition<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("guards", &self.guards.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Edge of the graph: `source --event/transition--> destination`.
pub struct StateConnection<E, C> {
    source: StateId,
    event: E,
    transition: Arc<Transition<E, C>>,
    destination: StateId,
}

impl<E, C> StateConnection<E, C> {
    pub(crate) fn new(
        source: StateId,
        event: E,
        transition: Arc<Transition<E, C>>,
        destination: StateId,
    ) -> Self {
        Self {
            source,
            event,
            transition,
            destination,
        }
    }

    pub fn source(&self) -> StateId {
        self.source
    }

    pub fn event(&self) -> &E {
        &self.event
    }

    pub fn transition(&self) -> &Arc<Transition<E, C>> {
        &self.transition
    }

    pub fn destination(&self) -> StateId {
        self.destination
    }
}

impl<E: fmt::Debug, C> fmt::Debug for StateConnection<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateConnection")
            .field("source", &self.source)
            .field("event", &self.event)
            .field("transition", &self.transition.name)
            .field("destination", &self.destination)
            .finish()
    }
}
