//! Daemon configuration.
//!
//! Several TOML files may be given; they are merged first-wins and a field
//! set in two files is an error reported against both locations.

#[allow(clippy::module_inception)]
mod config;
mod diagnostics;
mod partial;

pub use config::*;
pub use diagnostics::format_diagnostics;
pub use diagnostics::Diagnostic;
pub use diagnostics::LoadError;
