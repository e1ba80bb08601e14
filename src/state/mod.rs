// Generic event-driven state machine engine

mod dot;
mod engine;
mod entity;
mod graph;

pub use engine::{Forward, StateMachine};
pub use entity::{MachineState, ValueStore};
pub use graph::{Action, ActionRef, Failure, Graph, Node, Outcome, Transition, Trigger};
