//! Types shared between the controller, the protocol client and the binary.

use std::ffi::OsString;
use std::path::PathBuf;

use gx_types::ClientState;

/// How to start the language server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Added to the inherited environment.
    pub env: Vec<(OsString, OsString)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Space-joined command line, for logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Why the server process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStopReason {
    /// Closed its output stream.
    Exited,
    /// The stream broke or carried something undecodable.
    Failed(String),
}

/// Events drained by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LspEvent {
    StateChanged(ClientState),
    ServerStopped { reason: ServerStopReason },
}
