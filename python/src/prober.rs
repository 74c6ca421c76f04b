//! Capability probing.
//!
//! Whether an environment can host the language server is decided by the
//! companion package itself, through its `is-language-server-available`
//! subcommand. The answer is free text on stdout; [`interpret_self_check`] is
//! the only place that reads it.

use std::sync::Arc;

use gx_types::Capability;

use crate::environment::{COMPANION_PACKAGE, Environment};
use crate::runner::{CommandOutput, CommandRunner};

pub const SERVER_AVAILABLE_MARKER: &str = "Language server is available.";
pub const SERVER_UNAVAILABLE_MARKER: &str = "Language server is not available.";

/// Translate the self-check result into a [`Capability`].
///
/// | result                                        | capability               |
/// |-----------------------------------------------|--------------------------|
/// | exit 0, stdout has [`SERVER_AVAILABLE_MARKER`]   | `InstalledWithServer`    |
/// | exit 0, stdout has [`SERVER_UNAVAILABLE_MARKER`] | `InstalledWithoutServer` |
/// | nonzero exit or killed by a signal            | `InstalledWithoutServer` |
/// | exit 0, anything else                         | `UnexpectedOutput`       |
#[must_use]
pub fn interpret_self_check(output: &CommandOutput) -> Capability {
    if !output.is_success() {
        return Capability::InstalledWithoutServer;
    }
    if output.stdout.contains(SERVER_UNAVAILABLE_MARKER) {
        return Capability::InstalledWithoutServer;
    }
    if output.stdout.contains(SERVER_AVAILABLE_MARKER) {
        return Capability::InstalledWithServer;
    }
    Capability::UnexpectedOutput
}

pub struct Prober {
    runner: Arc<dyn CommandRunner>,
}

impl Prober {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Probe `env` once; later calls on the same descriptor return the cached
    /// value.
    pub async fn capability(&self, env: &Environment) -> Capability {
        *env.capability_cell()
            .get_or_init(|| self.probe(env))
            .await
    }

    /// True only for [`Capability::InstalledWithServer`].
    pub async fn has_server_capability(&self, env: &Environment) -> bool {
        self.capability(env).await.has_server()
    }

    async fn probe(&self, env: &Environment) -> Capability {
        if !env.has_companion() {
            tracing::debug!(env = %env.id(), "{COMPANION_PACKAGE} not installed");
            return Capability::NotInstalled;
        }

        let invocation = env
            .command()
            .args(["-m", COMPANION_PACKAGE, "is-language-server-available"]);
        let capability = match self.runner.run(&invocation).await {
            Ok(output) => interpret_self_check(&output),
            Err(err) => {
                tracing::warn!(env = %env.id(), "Self-check could not run: {err}");
                Capability::InstalledWithoutServer
            }
        };

        if capability == Capability::UnexpectedOutput {
            tracing::warn!(
                env = %env.id(),
                "Unrecognised self-check output; treating the language server as unavailable"
            );
        }
        tracing::info!(env = %env.id(), ?capability, "Capability probed");
        capability
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use gx_types::{PackageInfo, Version};

    use super::*;
    use crate::catalog::tests::ScriptedRunner;

    fn descriptor(packages: Vec<PackageInfo>) -> Environment {
        Environment::new(
            "/venv/bin/python",
            "/venv",
            "/venv/bin/python",
            Version::new(3, 12, 0),
            packages,
        )
    }

    fn output(exit_code: Option<i32>, signal: Option<i32>, stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            exit_code,
            signal,
            ..CommandOutput::default()
        }
    }

    #[test]
    fn self_check_translation_table() {
        assert_eq!(
            interpret_self_check(&output(Some(0), None, "Language server is available.\n")),
            Capability::InstalledWithServer
        );
        assert_eq!(
            interpret_self_check(&output(Some(0), None, "Language server is not available.\n")),
            Capability::InstalledWithoutServer
        );
        assert_eq!(
            interpret_self_check(&output(Some(1), None, "Language server is available.")),
            Capability::InstalledWithoutServer
        );
        assert_eq!(
            interpret_self_check(&output(None, Some(9), "")),
            Capability::InstalledWithoutServer
        );
        assert_eq!(
            interpret_self_check(&output(Some(0), None, "LSP OK")),
            Capability::UnexpectedOutput
        );
    }

    #[tokio::test]
    async fn missing_package_never_spawns() {
        let runner = Arc::new(ScriptedRunner::default());
        let prober = Prober::new(runner.clone());
        let env = descriptor(vec![PackageInfo::new("pip", "24.0")]);

        assert!(!prober.has_server_capability(&env).await);
        assert_eq!(prober.capability(&env).await, Capability::NotInstalled);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_runs_at_most_once_per_descriptor() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("is-language-server-available", 0, "Language server is available.");
        let prober = Prober::new(runner.clone());
        let env = descriptor(vec![PackageInfo::new("pygerber", "2.4.1")]);

        assert!(prober.has_server_capability(&env).await);
        assert!(prober.has_server_capability(&env).await);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(env.cached_capability(), Some(Capability::InstalledWithServer));

        // A fresh descriptor is probed again.
        let fresh = descriptor(vec![PackageInfo::new("pygerber", "2.4.1")]);
        assert!(prober.has_server_capability(&fresh).await);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_self_check_fails_closed() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("is-language-server-available", 1, "Language server is available.");
        let prober = Prober::new(runner);
        let env = descriptor(vec![PackageInfo::new("pygerber", "2.4.1")]);

        assert_eq!(
            prober.capability(&env).await,
            Capability::InstalledWithoutServer
        );
    }
}
