// Configuration loading
pub mod config;

// Device and room metadata
pub mod directory;

// Buffered bulk dispatch
pub mod dispatch;

// Elasticsearch event source and bulk sink
pub mod elastic;

// Error taxonomy
pub mod error;

// Event model and validation
pub mod event;

// Windowed event feeder
pub mod feeder;

// Display-state metrics caterpillar
pub mod metrics;

// Job registry, checkpoints and runs
pub mod pipeline;

// Class schedule lookup
pub mod schedule;

// State machine engine
pub mod state;

pub use error::Error;
pub use event::Event;
