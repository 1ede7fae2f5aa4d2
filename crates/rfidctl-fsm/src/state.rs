//! States and the graph that owns them.

use std::fmt;
use std::sync::Arc;

use rfidctl_core::{BoxError, Error, Result};

use crate::transition::{Action, ActionContext, StateConnection, Transition};

/// Index of a state inside its [`StateGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(usize);

impl StateId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node of the state graph.
///
/// The parent only contributes to the display path (`parent.child`); a
/// state never inherits its parent's connections or actions.
pub struct State<E, C> {
    id: StateId,
    name: String,
    parent: Option<StateId>,
    connections: Vec<Arc<StateConnection<E, C>>>,
    entry_actions: Vec<Arc<dyn Action<E, C>>>,
    exit_actions: Vec<Arc<dyn Action<E, C>>>,
}

impl<E, C> State<E, C> {
    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<StateId> {
        self.parent
    }

    /// Outgoing connections in declaration order.
    pub fn connections(&self) -> &[Arc<StateConnection<E, C>>] {
        &self.connections
    }

    pub(crate) fn entry_actions(&self) -> &[Arc<dyn Action<E, C>>] {
        &self.entry_actions
    }

    pub(crate) fn exit_actions(&self) -> &[Arc<dyn Action<E, C>>] {
        &self.exit_actions
    }
}

impl<E, C> fmt::Debug for State<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Arena of states wired together by connections.
///
/// Connections and actions can only be appended while the graph is being
/// built; once it is shared with an [`Fsm`](crate::Fsm) through an `Arc` it
/// is immutable.
pub struct StateGraph<E, C> {
    states: Vec<State<E, C>>,
}

impl<E, C> Default for StateGraph<E, C> {
    fn default() -> Self {
        Self { states: Vec::new() }
    }
}

impl<E, C> StateGraph<E, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a top-level state.
    pub fn add_state(&mut self, name: impl Into<String>) -> StateId {
        self.push_state(name.into(), None)
    }

    /// Add a state nested under `parent` for naming purposes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Construction` if `parent` is not part of this graph.
    pub fn add_substate(&mut self, name: impl Into<String>, parent: StateId) -> Result<StateId> {
        self.state(parent)?;
        Ok(self.push_state(name.into(), Some(parent)))
    }

    fn push_state(&mut self, name: String, parent: Option<StateId>) -> StateId {
        let id = StateId(self.states.len());
        self.states.push(State {
            id,
            name,
            parent,
            connections: Vec::new(),
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
        });
        id
    }

    /// Look up a state.
    ///
    /// # Errors
    ///
    /// Returns `Error::Construction` if `id` is not part of this graph.
    pub fn state(&self, id: StateId) -> Result<&State<E, C>> {
        self.states
            .get(id.0)
            .ok_or_else(|| Error::construction(format!("unknown state {id}")))
    }

    pub(crate) fn get(&self, id: StateId) -> &State<E, C> {
        &self.states[id.0]
    }

    fn state_mut(&mut self, id: StateId) -> Result<&mut State<E, C>> {
        self.states
            .get_mut(id.0)
            .ok_or_else(|| Error::construction(format!("unknown state {id}")))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Dotted path from the outermost ancestor, e.g. `active.running`.
    pub fn path(&self, id: StateId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(state) = self.states.get(current.0) else {
                break;
            };
            names.push(state.name.as_str());
            cursor = state.parent;
        }
        names.reverse();
        names.join(".")
    }

    /// Append an entry action to `state`.
    pub fn on_entry<F>(&mut self, state: StateId, action: F) -> Result<()>
    where
        F: Fn(&mut ActionContext<'_, E, C>) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.state_mut(state)?.entry_actions.push(Arc::new(action));
        Ok(())
    }

    /// Append an exit action to `state`.
    pub fn on_exit<F>(&mut self, state: StateId, action: F) -> Result<()>
    where
        F: Fn(&mut ActionContext<'_, E, C>) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.state_mut(state)?.exit_actions.push(Arc::new(action));
        Ok(())
    }

    /// Add an edge `source --event/transition--> destination`.
    ///
    /// A transition may be reused by any number of connections.
    ///
    /// # Errors
    ///
    /// Returns `Error::Construction` if either state is not part of this graph.
    pub fn connect(
        &mut self,
        source: StateId,
        event: E,
        transition: &Arc<Transition<E, C>>,
        destination: StateId,
    ) -> Result<()> {
        self.state(destination)?;
        let connection = Arc::new(StateConnection::new(
            source,
            event,
            Arc::clone(transition),
            destination,
        ));
        self.state_mut(source)?.connections.push(connection);
        Ok(())
    }
}

impl<E, C> fmt::Debug for StateGraph<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.states).finish()
    }
}
