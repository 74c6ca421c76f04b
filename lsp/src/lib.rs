//! Language server supervision: framing, the stdio protocol client and the
//! lifecycle controller.

pub mod client;
pub mod codec;
pub mod controller;
pub mod types;

pub(crate) mod protocol;

pub use client::{ClientFactory, ClientFut, LanguageClient, StdioClient, StdioClientFactory};
pub use controller::{LifecycleController, launch_spec};
pub use types::{LaunchSpec, LspEvent, ServerStopReason};
