//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Runtime of a BK215 device link: correlates set commands with their
//! acknowledgements, throttles data reports and pushes projections into a
//! state registry.

pub mod correlator;
pub mod link;
pub mod registry;
pub mod report_cache;

pub use correlator::{CommandCorrelator, CommandError, CommandSink, PendingCommand};
pub use link::{DeviceLink, LinkConfig, LinkHandle};
pub use registry::{MemoryRegistry, RegistryState, StateRegistry};
pub use report_cache::{project, Projection, ReportCache, ThrottleMode};
