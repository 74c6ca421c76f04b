//! Picks the environment the language server runs in.

use std::sync::Arc;

use gx_config::UserSettings;

use crate::environment::Environment;
use crate::prober::Prober;

/// Outcome of [`resolve_preferred`].
#[derive(Debug, Clone)]
pub enum Selection {
    /// The user's custom interpreter. Preferred unconditionally.
    Custom(Arc<Environment>),
    /// First environment, in catalog order, with the language server.
    Preferred(Arc<Environment>),
    /// No environment has the language server and fallback is off. Nothing is
    /// selected; `first` is only there for diagnostics.
    FallbackDisabled { first: Arc<Environment> },
    /// No environment has the language server; the first one is used anyway.
    BestEffort(Arc<Environment>),
    NoEnvironment,
}

impl Selection {
    /// The environment to launch in, if any.
    #[must_use]
    pub fn environment(&self) -> Option<&Arc<Environment>> {
        match self {
            Self::Custom(env) | Self::Preferred(env) | Self::BestEffort(env) => Some(env),
            Self::FallbackDisabled { .. } | Self::NoEnvironment => None,
        }
    }

    /// Whether no environment had the capability, so an install is worth
    /// offering.
    #[must_use]
    pub fn capability_missing(&self) -> bool {
        matches!(self, Self::FallbackDisabled { .. } | Self::BestEffort(_))
    }
}

/// Apply the selection policy. Probes capability through `prober` (and so
/// fills descriptor caches) but has no other effect.
pub async fn resolve_preferred(
    prober: &Prober,
    environments: &[Arc<Environment>],
    custom: Option<Arc<Environment>>,
    settings: &UserSettings,
) -> Selection {
    if let Some(custom) = custom {
        tracing::info!(env = %custom.id(), "Using custom interpreter");
        return Selection::Custom(custom);
    }

    for env in environments {
        if prober.has_server_capability(env).await {
            tracing::info!(env = %env.id(), "Selected environment");
            return Selection::Preferred(Arc::clone(env));
        }
    }

    let Some(first) = environments.first() else {
        return Selection::NoEnvironment;
    };

    if settings.allow_automatic_fallback {
        tracing::warn!(env = %first.id(), "No environment has the language server; falling back");
        Selection::BestEffort(Arc::clone(first))
    } else {
        tracing::warn!("No environment has the language server and fallback is disabled");
        Selection::FallbackDisabled {
            first: Arc::clone(first),
        }
    }
}
