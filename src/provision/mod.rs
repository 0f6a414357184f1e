//! Dependency and source provisioning.
//!
//! - [`tools`] installs missing build tools through the host package manager.
//! - [`source`] keeps the local badvpn checkout at the desired revision.
//!
//! Both are idempotent and safe to run on every install or update.

pub mod source;
pub mod tools;

pub use source::{sync_source, SourceSpec, SourceState, SyncOutcome, BUILD_DESCRIPTOR};
pub use tools::{ensure_tools, PackageManager, ToolsOutcome, REQUIRED_TOOLS};
