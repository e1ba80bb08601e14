use crate::error::Error;
use crate::event::{Event, ScopeKey};
use crate::state::entity::{MachineState, ValueStore};
use crate::state::graph::{ActionRef, Graph, Transition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives records produced by callbacks, one batch per executed step.
#[async_trait]
pub trait Forward<R>: Send + Sync {
    async fn forward(&self, records: Vec<R>);
}

/// Event-driven state machine keeping one [`MachineState`] per scope.
///
/// The graph is shared and immutable; the per-entity states are owned
/// exclusively by this instance for the duration of a run.
pub struct StateMachine<S, R> {
    graph: Arc<Graph<S, R>>,
    scope: ScopeKey,
    states: HashMap<String, MachineState<S>>,
}

impl<S: ValueStore, R: Send + 'static> StateMachine<S, R> {
    /// Create a machine with no known entities
    pub fn new(graph: Arc<Graph<S, R>>, scope: ScopeKey) -> Self {
        Self {
            graph,
            scope,
            states: HashMap::new(),
        }
    }

    /// Rehydrate a machine from persisted entity states.
    ///
    /// States parked on a node that no longer exists in the graph are reset
    /// to the start node with an empty store.
    pub fn with_states(
        graph: Arc<Graph<S, R>>,
        scope: ScopeKey,
        states: HashMap<String, MachineState<S>>,
    ) -> Self {
        let mut machine = Self::new(graph, scope);

        for (key, state) in states {
            if machine.graph.contains(&state.current_node) {
                machine.states.insert(key, state);
            } else {
                warn!(
                    entity = %key,
                    node = %state.current_node,
                    "Persisted node not in graph, resetting entity to start"
                );
                machine
                    .states
                    .insert(key, MachineState::at(machine.graph.start()));
            }
        }

        machine
    }

    /// Get the state of one scope
    pub fn state(&self, scope: &str) -> Option<&MachineState<S>> {
        self.states.get(scope)
    }

    /// All known entity states
    pub fn states(&self) -> &HashMap<String, MachineState<S>> {
        &self.states
    }

    /// Consume the machine, returning the entity states for persistence
    pub fn into_states(self) -> HashMap<String, MachineState<S>> {
        self.states
    }

    pub fn graph(&self) -> &Graph<S, R> {
        &self.graph
    }

    /// Push one event through the machine.
    ///
    /// Looks up (or creates) the state for the event's scope and fires the
    /// first matching transition of the current node. An event no transition
    /// matches is a no-op. Callback errors abort the transition, leaving the
    /// entity on its current node, and are returned to the caller.
    pub async fn process_event<F>(&mut self, event: &Event, out: &F) -> Result<(), Error>
    where
        F: Forward<R> + ?Sized,
    {
        let graph = Arc::clone(&self.graph);
        let key = event.scope(self.scope).to_string();

        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| MachineState::at(graph.start()));

        debug!(
            entity = %key,
            node = %state.current_node,
            key = %event.key,
            value = %event.value,
            timestamp = %event.timestamp,
            "Processing event"
        );

        let node = graph
            .node(&state.current_node)
            .ok_or_else(|| Error::UnknownNode(state.current_node.clone()))?;

        let Some((index, transition)) = node
            .transitions
            .iter()
            .enumerate()
            .find(|(_, t)| t.matches(event, &state.store))
        else {
            return Ok(());
        };

        match &transition.id {
            Some(id) => debug!(entity = %key, transition = %id, "Transitioning"),
            None => debug!(
                entity = %key,
                transition = index,
                node = %node.id,
                "Transitioning"
            ),
        }

        run_transition(&graph, transition, state, event, out).await?;

        Ok(())
    }
}

/// Execute exit, actions, enter and the node move, in that order.
async fn run_transition<S, R, F>(
    graph: &Graph<S, R>,
    transition: &Transition<S, R>,
    state: &mut MachineState<S>,
    event: &Event,
    out: &F,
) -> Result<(), Error>
where
    S: ValueStore,
    R: Send + 'static,
    F: Forward<R> + ?Sized,
{
    let internal = transition.internal && transition.destination == state.current_node;

    if !internal {
        let exit = graph
            .node(&state.current_node)
            .and_then(|n| n.on_exit.as_ref());
        if let Some(exit) = exit {
            run_step(exit, &mut state.store, event, out).await?;
        }
    }

    for action in &transition.actions {
        run_step(action, &mut state.store, event, out).await?;
    }

    if !internal {
        let enter = graph
            .node(&transition.destination)
            .and_then(|n| n.on_enter.as_ref());
        if let Some(enter) = enter {
            run_step(enter, &mut state.store, event, out).await?;
        }
    }

    state.current_node = transition.destination.clone();
    Ok(())
}

/// Run a single callback and forward whatever it produced, even on failure.
async fn run_step<S, R, F>(
    action: &ActionRef<S, R>,
    store: &mut S,
    event: &Event,
    out: &F,
) -> Result<(), Error>
where
    S: ValueStore,
    R: Send + 'static,
    F: Forward<R> + ?Sized,
{
    match action.execute(store, event).await {
        Ok(records) => {
            if !records.is_empty() {
                debug!(step = %action.label(), records = records.len(), "Step produced records");
                out.forward(records).await;
            }
            Ok(())
        }
        Err(failure) => {
            if !failure.records.is_empty() {
                out.forward(failure.records).await;
            }
            Err(failure.error)
        }
    }
}
