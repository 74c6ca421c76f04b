//! Python environments for gx.
//!
//! Leaf-first:
//! - [`runner`]: external command execution
//! - [`discovery`]: which interpreters exist on the host
//! - [`catalog`]: candidates resolved into [`Environment`] descriptors
//! - [`prober`]: does an environment have the language server
//! - [`selector`]: which environment the language server should use
//! - [`companion`]: install, version index and render through the companion package

pub mod catalog;
pub mod companion;
pub mod discovery;
pub mod environment;
pub mod prober;
pub mod runner;
pub mod selector;

pub use catalog::{CatalogError, CatalogSnapshot, EnvironmentCatalog};
pub use companion::{
    InstallError, RenderError, default_output_path, install, language_server_module,
    query_versions, render,
};
pub use discovery::{
    Candidate, Discovery, DiscoveryChange, DiscoveryError, DiscoveryFut, HostDiscovery,
    SearchRoots,
};
pub use environment::{COMPANION_PACKAGE, Environment, EnvironmentOrigin};
pub use prober::{Prober, interpret_self_check};
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner, RunError, RunFut};
pub use selector::{Selection, resolve_preferred};
