//! Language server lifecycle.
//!
//! [`LifecycleController`] owns at most one [`LanguageClient`]. Restarts go
//! through a gate with try-acquire semantics: a restart that finds the gate
//! taken returns [`RestartResult::Aborted`] at once and is dropped, never
//! queued. The gate is an RAII guard, so every exit path releases it.

use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use gx_config::{SettingsSource, UserSettings};
use gx_python::{
    Environment, EnvironmentCatalog, Prober, Selection, language_server_module, resolve_preferred,
};
use gx_types::{ClientState, RestartResult};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{ClientFactory, LanguageClient};
use crate::types::{LaunchSpec, LspEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Command line for the language server in `env`: the version-appropriate
/// module, then the user's extra arguments. Runs in the workspace root with
/// the environment's `PYTHONPATH`.
#[must_use]
pub fn launch_spec(env: &Environment, settings: &UserSettings) -> LaunchSpec {
    let base = env.command();
    let mut args: Vec<OsString> = vec!["-m".into(), language_server_module(env).into()];
    args.extend(settings.args.iter().map(OsString::from));
    LaunchSpec {
        program: base.program,
        args,
        env: base.env,
        cwd: Some(settings.workspace_root.clone()),
    }
}

pub struct LifecycleController {
    catalog: Arc<EnvironmentCatalog>,
    prober: Prober,
    settings: Arc<dyn SettingsSource>,
    factory: Arc<dyn ClientFactory>,
    gate: Mutex<()>,
    client: StdMutex<Option<Box<dyn LanguageClient>>>,
    /// Task logging the current client's state transitions.
    watcher: StdMutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<LspEvent>,
    event_rx: Mutex<mpsc::Receiver<LspEvent>>,
}

impl LifecycleController {
    #[must_use]
    pub fn new(
        catalog: Arc<EnvironmentCatalog>,
        prober: Prober,
        settings: Arc<dyn SettingsSource>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            catalog,
            prober,
            settings,
            factory,
            gate: Mutex::new(()),
            client: StdMutex::new(None),
            watcher: StdMutex::new(None),
            event_tx,
            event_rx: Mutex::new(event_rx),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<EnvironmentCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    /// Choose an environment from the current catalog snapshot and restart
    /// the server in it.
    ///
    /// The catalog is not refreshed here; callers refresh it first when
    /// discovery has changed.
    pub async fn refresh(&self) -> RestartResult {
        let settings = self.settings.snapshot();
        if !settings.enable {
            tracing::info!("Language server disabled in settings");
            return RestartResult::SilentAborted;
        }

        let custom = match &settings.custom_interpreter_path {
            Some(path) => match self.catalog.resolve_custom(path, &settings).await {
                Some(env) => Some(env),
                None => return RestartResult::AbortedNoPythonEnvironment,
            },
            None => None,
        };

        let snapshot = self.catalog.snapshot();
        if custom.is_none() {
            if snapshot.discovery_unavailable() {
                tracing::warn!("No Python environment discovery available");
                return RestartResult::AbortedNoPythonEnvironment;
            }
            if snapshot.environments().is_empty() {
                tracing::warn!("No Python environments found");
                return RestartResult::AbortedNoPythonEnvironment;
            }
        }

        let selection =
            resolve_preferred(&self.prober, snapshot.environments(), custom, &settings).await;
        match selection {
            Selection::Custom(env) | Selection::Preferred(env) | Selection::BestEffort(env) => {
                self.restart(env).await
            }
            Selection::FallbackDisabled { first } if !first.has_companion() => {
                RestartResult::AbortedNoPyGerber
            }
            Selection::FallbackDisabled { .. } => RestartResult::AbortedNoLanguageServer,
            Selection::NoEnvironment => RestartResult::AbortedNoPythonEnvironment,
        }
    }

    /// Stop the current server and start one in `env`.
    ///
    /// Returns [`RestartResult::Aborted`] without doing anything when another
    /// restart is in progress.
    pub async fn restart(&self, env: Arc<Environment>) -> RestartResult {
        let Ok(_gate) = self.gate.try_lock() else {
            tracing::info!(env = %env.id(), "Restart already in progress; request dropped");
            return RestartResult::Aborted;
        };
        let settings = self.settings.snapshot();

        self.release_subscriptions();
        self.stop_client().await;

        if !env.has_companion() {
            tracing::warn!(env = %env.id(), "pygerber is not installed");
            return RestartResult::AbortedNoPyGerber;
        }
        if !self.prober.has_server_capability(&env).await {
            tracing::warn!(env = %env.id(), "pygerber has no language server");
            return RestartResult::AbortedNoLanguageServer;
        }

        let spec = launch_spec(&env, &settings);
        let client = match self.factory.start(&spec, self.event_tx.clone()).await {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(env = %env.id(), "Failed to start the language server: {err:#}");
                return RestartResult::Failed;
            }
        };

        let state = client.subscribe_state();
        self.watch_state(client.subscribe_state());
        *self.client_slot() = Some(client);

        match await_settled(&state, settings.start_timeout, settings.poll_interval).await {
            ClientState::Running => {
                tracing::info!(env = %env.id(), "Language server running");
                RestartResult::Success
            }
            other => {
                tracing::warn!(
                    env = %env.id(),
                    state = %other,
                    timeout = ?settings.start_timeout,
                    "Language server did not start"
                );
                self.release_subscriptions();
                self.stop_client().await;
                RestartResult::Failed
            }
        }
    }

    /// Stop the server and drop state subscriptions. Safe to call repeatedly.
    pub async fn dispose(&self) {
        self.release_subscriptions();
        self.stop_client().await;
    }

    /// `None` when no client exists.
    #[must_use]
    pub fn client_state(&self) -> Option<ClientState> {
        self.client_slot().as_ref().map(|client| client.state())
    }

    /// Drain up to `budget` pending events without waiting.
    pub fn poll_events(&self, budget: usize) -> Vec<LspEvent> {
        let Ok(mut rx) = self.event_rx.try_lock() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while events.len() < budget {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        events
    }

    /// Wait for the next event.
    pub async fn next_event(&self) -> Option<LspEvent> {
        self.event_rx.lock().await.recv().await
    }

    fn client_slot(&self) -> MutexGuard<'_, Option<Box<dyn LanguageClient>>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watcher_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_subscriptions(&self) {
        if let Some(task) = self.watcher_slot().take() {
            task.abort();
        }
    }

    async fn stop_client(&self) {
        let client = self.client_slot().take();
        let Some(client) = client else {
            return;
        };
        if client.state() == ClientState::Stopped {
            return;
        }
        tracing::info!("Stopping language server");
        client.stop().await;
    }

    fn watch_state(&self, mut state: watch::Receiver<ClientState>) {
        let events = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let mut last = *state.borrow_and_update();
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                if current == last {
                    continue;
                }
                last = current;
                tracing::info!(target: "gx::server", state = %current, "Language server state changed");
                if events.try_send(LspEvent::StateChanged(current)).is_err() {
                    tracing::debug!("Event channel full; state event dropped");
                }
            }
        });
        if let Some(previous) = self.watcher_slot().replace(task) {
            previous.abort();
        }
    }
}

/// Poll `state` every `interval` until it leaves `Starting` or `timeout`
/// elapses. Returns the last observed state.
async fn await_settled(
    state: &watch::Receiver<ClientState>,
    timeout: Duration,
    interval: Duration,
) -> ClientState {
    let deadline = Instant::now() + timeout;
    loop {
        let current = *state.borrow();
        if current != ClientState::Starting || Instant::now() >= deadline {
            return current;
        }
        tokio::time::sleep(interval).await;
    }
}
