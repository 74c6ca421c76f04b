//! Text shown to the user: the environment tree, notifications and exit
//! codes. Pure functions; printing happens in `commands`.

use std::fmt::Write as _;
use std::sync::Arc;

use gx_config::UserSettings;
use gx_lsp::{LspEvent, ServerStopReason};
use gx_python::{COMPANION_PACKAGE, Environment};
use gx_types::{Capability, RestartResult, Warning};

/// Notification for a lifecycle result. `None` means stay quiet.
#[must_use]
pub(crate) fn restart_message(result: RestartResult) -> Option<&'static str> {
    match result {
        RestartResult::Success | RestartResult::SilentAborted => None,
        RestartResult::Failed => Some("Failed to start the language server."),
        RestartResult::Aborted => Some("Restart of the language server already in progress."),
        RestartResult::AbortedNoPyGerber => {
            Some("PyGerber is not installed in the selected Python environment.")
        }
        RestartResult::AbortedNoLanguageServer => {
            Some("PyGerber Language Server is not available in the selected Python environment.")
        }
        RestartResult::AbortedNoPythonEnvironment => Some(
            "No Python environment available. Make sure a Python interpreter is installed.",
        ),
    }
}

/// Process exit status for `gx serve` after the initial start.
#[must_use]
pub(crate) fn exit_status(result: RestartResult) -> u8 {
    u8::from(result.is_reportable_failure())
}

/// Whether a result means no environment could host the server, so an
/// install should be offered.
#[must_use]
pub(crate) fn offers_install(result: RestartResult) -> bool {
    matches!(
        result,
        RestartResult::AbortedNoPyGerber | RestartResult::AbortedNoLanguageServer
    )
}

/// Warning text with its dismissal hint, or `None` if dismissed.
#[must_use]
pub(crate) fn warning_notice(settings: &UserSettings, warning: Warning) -> Option<String> {
    if settings.is_ignored(warning) {
        return None;
    }
    let body = match warning {
        Warning::DiscoveryUnavailable => {
            "Python environment discovery is unavailable: no interpreters on PATH and no \
             virtualenv, pyenv or conda installs found. Install Python or set \
             custom_interpreter_path."
                .to_string()
        }
        Warning::NoQualifyingEnvironment => format!(
            "No Python environment has {COMPANION_PACKAGE} with the language server. \
             Run `gx install` to install it."
        ),
    };
    Some(format!(
        "warning: {body}\n  (hide with `gx ignore-warning {}`)",
        warning.id()
    ))
}

#[must_use]
pub(crate) fn stop_reason(reason: &ServerStopReason) -> String {
    match reason {
        ServerStopReason::Exited => "The language server exited.".to_string(),
        ServerStopReason::Failed(message) => {
            format!("The language server connection failed: {message}")
        }
    }
}

/// Line printed for a server event, and whether supervision should end.
#[must_use]
pub(crate) fn event_notice(event: &LspEvent) -> (String, bool) {
    match event {
        LspEvent::StateChanged(state) => (format!("Language server: {state}"), false),
        LspEvent::ServerStopped { reason } => (stop_reason(reason), true),
    }
}

/// Hint for environments that have the package but not its language server.
/// `None` once any environment can host the server.
#[must_use]
pub(crate) fn missing_server_hint(rows: &[(Arc<Environment>, Capability)]) -> Option<String> {
    if rows.iter().any(|(_, capability)| capability.has_server()) {
        return None;
    }
    let (env, _) = rows.iter().find(|(_, capability)| {
        capability.is_installed() && *capability != Capability::UnexpectedOutput
    })?;
    Some(format!(
        "{COMPANION_PACKAGE} is installed in {} without the language server. \
         Run `gx install --env {}` to add it.",
        env.path().display(),
        env.id()
    ))
}

fn capability_label(capability: Capability) -> &'static str {
    match capability {
        Capability::InstalledWithServer => "Available",
        Capability::InstalledWithoutServer => "Not available",
        Capability::NotInstalled => "Not installed",
        Capability::UnexpectedOutput => "Unknown (unexpected self-check output)",
    }
}

/// One entry per environment, numbered for `gx activate`.
#[must_use]
pub(crate) fn environment_tree(rows: &[(Arc<Environment>, Capability)]) -> String {
    let mut out = String::new();
    for (index, (env, capability)) in rows.iter().enumerate() {
        let active = if env.is_active() { " (Active)" } else { "" };
        let companion = env
            .package(COMPANION_PACKAGE)
            .map_or("Not installed", |package| package.version.as_str());

        let _ = writeln!(out, "[{index}] Python {}{active}", env.version());
        let _ = writeln!(out, "    ├─ Environment: {}", env.path().display());
        let _ = writeln!(out, "    ├─ Executable: {}", env.executable().display());
        let _ = writeln!(out, "    ├─ Version: {}", env.version());
        let _ = writeln!(out, "    ├─ PyGerber: {companion}");
        let _ = writeln!(out, "    └─ Language Server: {}", capability_label(*capability));
    }
    out
}

/// Match `selector` against a list index, an id or an executable path.
#[must_use]
pub(crate) fn find_environment<'a>(
    environments: &'a [Arc<Environment>],
    selector: &str,
) -> Option<&'a Arc<Environment>> {
    if let Ok(index) = selector.parse::<usize>() {
        return environments.get(index);
    }
    environments.iter().find(|env| {
        env.id() == selector || env.executable() == std::path::Path::new(selector)
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use gx_types::{PackageInfo, Version};

    use super::*;

    fn env(name: &str, packages: Vec<PackageInfo>) -> Arc<Environment> {
        let exe = format!("/envs/{name}/bin/python");
        Arc::new(Environment::new(
            format!("id-{name}"),
            format!("/envs/{name}"),
            exe,
            Version::new(3, 12, 1),
            packages,
        ))
    }

    #[test]
    fn quiet_results_have_no_message() {
        assert_eq!(restart_message(RestartResult::Success), None);
        assert_eq!(restart_message(RestartResult::SilentAborted), None);
        assert_eq!(
            restart_message(RestartResult::Failed),
            Some("Failed to start the language server.")
        );
        assert_eq!(
            restart_message(RestartResult::Aborted),
            Some("Restart of the language server already in progress.")
        );
    }

    #[test]
    fn exit_status_policy() {
        assert_eq!(exit_status(RestartResult::Success), 0);
        assert_eq!(exit_status(RestartResult::SilentAborted), 0);
        for failing in [
            RestartResult::Failed,
            RestartResult::Aborted,
            RestartResult::AbortedNoPyGerber,
            RestartResult::AbortedNoLanguageServer,
            RestartResult::AbortedNoPythonEnvironment,
        ] {
            assert_eq!(exit_status(failing), 1, "{failing:?}");
        }
    }

    #[test]
    fn dismissed_warnings_are_hidden() {
        let mut settings = UserSettings::defaults(Path::new("/work"));
        let notice = warning_notice(&settings, Warning::NoQualifyingEnvironment).unwrap();
        assert!(notice.contains("gx install"));
        assert!(notice.contains("gx ignore-warning no-qualifying-environment"));

        settings.ignored_warnings = vec!["no-qualifying-environment".to_string()];
        assert_eq!(warning_notice(&settings, Warning::NoQualifyingEnvironment), None);
        assert!(warning_notice(&settings, Warning::DiscoveryUnavailable).is_some());
    }

    #[test]
    fn tree_lists_every_field() {
        let active = Arc::new(
            Environment::new(
                "id-a",
                "/envs/a",
                "/envs/a/bin/python",
                Version::new(3, 11, 4),
                vec![PackageInfo::new("pygerber", "3.0.0a2")],
            )
            .active(true),
        );
        let rows = vec![
            (active, Capability::InstalledWithServer),
            (env("b", vec![]), Capability::NotInstalled),
        ];
        let tree = environment_tree(&rows);

        assert!(tree.contains("[0] Python 3.11.4 (Active)"));
        assert!(tree.contains("├─ Executable: /envs/a/bin/python"));
        assert!(tree.contains("├─ PyGerber: 3.0.0a2"));
        assert!(tree.contains("└─ Language Server: Available"));
        assert!(tree.contains("[1] Python 3.12.1\n"));
        assert!(tree.contains("├─ PyGerber: Not installed"));
    }

    #[test]
    fn environments_found_by_index_id_or_path() {
        let envs = vec![env("a", vec![]), env("b", vec![])];
        assert_eq!(find_environment(&envs, "1").map(|e| e.id()), Some("id-b"));
        assert_eq!(find_environment(&envs, "id-a").map(|e| e.id()), Some("id-a"));
        assert_eq!(
            find_environment(&envs, "/envs/b/bin/python").map(|e| e.id()),
            Some("id-b")
        );
        assert!(find_environment(&envs, "7").is_none());
        assert!(find_environment(&envs, "nope").is_none());
    }

    #[test]
    fn only_a_server_stop_ends_supervision() {
        let (line, ends) = event_notice(&LspEvent::ServerStopped {
            reason: ServerStopReason::Exited,
        });
        assert_eq!(line, "The language server exited.");
        assert!(ends);

        let (line, ends) = event_notice(&LspEvent::StateChanged(gx_types::ClientState::Running));
        assert_eq!(line, "Language server: Running");
        assert!(!ends);
    }

    #[test]
    fn hint_names_an_environment_missing_only_the_server() {
        let rows = vec![
            (env("a", vec![]), Capability::NotInstalled),
            (
                env("b", vec![PackageInfo::new("pygerber", "2.4.0")]),
                Capability::InstalledWithoutServer,
            ),
        ];
        let hint = missing_server_hint(&rows).unwrap();
        assert!(hint.contains("/envs/b"));
        assert!(hint.contains("gx install --env id-b"));

        let none_installed = vec![(env("a", vec![]), Capability::NotInstalled)];
        assert_eq!(missing_server_hint(&none_installed), None);

        let mut served = rows.clone();
        served.push((env("c", vec![]), Capability::InstalledWithServer));
        assert_eq!(missing_server_hint(&served), None);
    }

    #[test]
    fn install_is_offered_only_for_missing_capability() {
        assert!(offers_install(RestartResult::AbortedNoPyGerber));
        assert!(offers_install(RestartResult::AbortedNoLanguageServer));
        assert!(!offers_install(RestartResult::AbortedNoPythonEnvironment));
        assert!(!offers_install(RestartResult::Failed));
    }
}
