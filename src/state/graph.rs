use crate::error::Error;
use crate::event::Event;
use crate::state::entity::ValueStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Result of running one callback.
pub type Outcome<R> = Result<Vec<R>, Failure<R>>;

/// A failed callback.
///
/// `records` holds best-effort output that is still forwarded before the
/// error aborts the transition.
#[derive(Debug)]
pub struct Failure<R> {
    pub records: Vec<R>,
    pub error: Error,
}

impl<R> Failure<R> {
    pub fn with_records(records: Vec<R>, error: Error) -> Self {
        Self { records, error }
    }
}

impl<R> From<Error> for Failure<R> {
    fn from(error: Error) -> Self {
        Self {
            records: Vec::new(),
            error,
        }
    }
}

/// Side-effecting step of a transition: a node's enter/exit hook or one of
/// the transition's own actions.
///
/// Implementations read and update the entity's value store and may return
/// records to forward downstream.
#[async_trait]
pub trait Action<S, R>: Send + Sync {
    /// Human readable name, used when rendering the graph.
    fn label(&self) -> String;

    async fn execute(&self, store: &mut S, event: &Event) -> Outcome<R>;
}

pub type ActionRef<S, R> = Arc<dyn Action<S, R>>;

/// Condition on the event value for a transition to fire.
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    /// Any value matches.
    Any,
    /// The event value must equal this literal.
    Equals(String),
    /// The event value must equal the named slot of the value store.
    StoreValue(String),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Any => write!(f, "*"),
            Trigger::Equals(v) => write!(f, "{}", v),
            Trigger::StoreValue(slot) => write!(f, "== store[{}]", slot),
        }
    }
}

/// Edge out of a node.
pub struct Transition<S, R> {
    pub id: Option<String>,
    pub trigger_key: String,
    pub trigger: Trigger,
    pub actions: Vec<ActionRef<S, R>>,
    pub destination: String,
    /// Suppresses exit/enter hooks when the destination is the current node.
    pub internal: bool,
}

impl<S: ValueStore, R: Send> Transition<S, R> {
    pub fn new(trigger_key: &str, trigger: Trigger, destination: &str) -> Self {
        Self {
            id: None,
            trigger_key: trigger_key.to_string(),
            trigger,
            actions: Vec::new(),
            destination: destination.to_string(),
            internal: false,
        }
    }

    pub fn named(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn action(mut self, action: ActionRef<S, R>) -> Self {
        self.actions.push(action);
        self
    }

    /// Check whether this transition fires for `event` given the entity's store.
    pub fn matches(&self, event: &Event, store: &S) -> bool {
        if event.key != self.trigger_key {
            return false;
        }

        match &self.trigger {
            Trigger::Any => true,
            Trigger::Equals(value) => event.value == *value,
            Trigger::StoreValue(slot) => match store.slot(slot) {
                Some(stored) => event.value == stored,
                None => {
                    warn!(slot = %slot, "No value stored for trigger slot");
                    false
                }
            },
        }
    }
}

/// Named state with optional enter/exit hooks and ordered outgoing transitions.
///
/// When several transitions match an event, the first declared wins.
pub struct Node<S, R> {
    pub id: String,
    pub on_enter: Option<ActionRef<S, R>>,
    pub on_exit: Option<ActionRef<S, R>>,
    pub transitions: Vec<Transition<S, R>>,
}

impl<S: ValueStore, R: Send> Node<S, R> {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            on_enter: None,
            on_exit: None,
            transitions: Vec::new(),
        }
    }

    pub fn on_enter(mut self, action: ActionRef<S, R>) -> Self {
        self.on_enter = Some(action);
        self
    }

    pub fn on_exit(mut self, action: ActionRef<S, R>) -> Self {
        self.on_exit = Some(action);
        self
    }

    pub fn transition(mut self, transition: Transition<S, R>) -> Self {
        self.transitions.push(transition);
        self
    }
}

/// Compiled, immutable node graph shared by every entity of a machine.
pub struct Graph<S, R> {
    pub(crate) nodes: HashMap<String, Node<S, R>>,
    /// Declaration order, kept for deterministic rendering.
    pub(crate) order: Vec<String>,
    start: String,
}

impl<S, R> fmt::Debug for Graph<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("start", &self.start)
            .field("nodes", &self.order)
            .finish()
    }
}

impl<S: ValueStore, R: Send> Graph<S, R> {
    /// Compile a node list into a graph.
    ///
    /// Fails with `invalid-config` on duplicate node ids, a missing start
    /// node, or a transition pointing at an undeclared node.
    pub fn compile(nodes: Vec<Node<S, R>>, start: &str) -> Result<Self, Error> {
        let mut map = HashMap::with_capacity(nodes.len());
        let mut order = Vec::with_capacity(nodes.len());

        for node in nodes {
            if map.contains_key(&node.id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            order.push(node.id.clone());
            map.insert(node.id.clone(), node);
        }

        if !map.contains_key(start) {
            return Err(Error::InvalidConfig(format!(
                "start node '{}' is not declared",
                start
            )));
        }

        for node in map.values() {
            for t in &node.transitions {
                if !map.contains_key(&t.destination) {
                    return Err(Error::InvalidConfig(format!(
                        "transition on '{}' from node '{}' targets unknown node '{}'",
                        t.trigger_key, node.id, t.destination
                    )));
                }
            }
        }

        Ok(Self {
            nodes: map,
            order,
            start: start.to_string(),
        })
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Node<S, R>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
