// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - schema:    Telemetry sample, refresh request and disk record shapes
// - cache:     TTL cache with hash-deduplicated snapshot persistence
// - collector: Local collector subprocess (line protocol, supervisor)
// - pool:      WebSocket pool for remote collectors
// - telemetry: Facade used by the rest of the application
// - config:    Configuration structs loaded from JSON
// - metrics:   Global runtime counters
// - util:      Shared helpers (time, id handling)
//
pub mod cache;
pub mod collector;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod schema;
pub mod telemetry;
pub mod util;

pub use schema::TelemetrySample;
pub use telemetry::{Telemetry, TelemetrySettings};
