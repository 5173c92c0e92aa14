// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::metrics;
pub use infrastructure::postgres;

pub mod config;
pub mod error;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
