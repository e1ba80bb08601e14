use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Per-entity scratch state carried across events and between runs.
///
/// The engine treats the store as opaque apart from [`ValueStore::slot`],
/// which backs store-value transition triggers.
pub trait ValueStore:
    Default + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Read a named slot as a string, `None` when unset.
    fn slot(&self, name: &str) -> Option<String>;
}

/// Machine position of one entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineState<S> {
    /// Node the entity currently sits in (always a node of the compiled graph)
    pub current_node: String,

    /// Domain-specific value store
    pub store: S,
}

impl<S: ValueStore> MachineState<S> {
    /// Fresh state positioned at `start` with an empty store.
    pub fn at(start: &str) -> Self {
        Self {
            current_node: start.to_string(),
            store: S::default(),
        }
    }
}
