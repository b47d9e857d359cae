/// Local collector module
///
/// This module groups all logic responsible for:
/// - Speaking the line protocol with the collector subprocess
/// - Keeping that subprocess alive (heartbeat, restart with backoff)
/// - Routing reported HostInfo into the shared cache
///
/// Design notes:
/// - One supervisor owns at most one child process
/// - All child callbacks funnel into a single tagged event queue
/// - Nothing here may take the host process down
pub mod backoff;
pub mod protocol;
pub mod supervisor;

pub use supervisor::{
    start, SupervisorConfig, SupervisorHandle, SupervisorState, SupervisorStatus,
    SupervisorTimings,
};
