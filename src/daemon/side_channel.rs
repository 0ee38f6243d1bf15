//! VNC / RDP viewer servers, started and stopped on request.
//!
//! Which server is installed varies by OS, so each viewer searches an
//! ordered list of executables and renders the matching start/stop
//! template. Only `{path}` and `{exe_name}` are substituted, and the
//! substituted values are quoted for the platform shell.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::computer::Computer;
use crate::protocol::{Action, ActionResponse, CommandAction};

/// Seconds a start/stop command may run.
const COMMAND_TIMEOUT_SECS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerKind {
    Vnc,
    Rdp,
}

impl fmt::Display for ViewerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vnc => f.write_str("VNC"),
            Self::Rdp => f.write_str("RDP"),
        }
    }
}

/// Search list and command templates for one viewer type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerConfig {
    /// Tried in order; the first one found on the search path wins.
    pub executables: Vec<String>,
    /// Start template keyed by lowercase executable file name.
    #[serde(default)]
    pub start_commands: BTreeMap<String, String>,
    #[serde(default)]
    pub stop_commands: BTreeMap<String, String>,
    pub default_start: String,
    pub default_stop: String,
}

impl ViewerConfig {
    pub fn default_vnc() -> Self {
        if cfg!(windows) {
            Self {
                executables: strings(&["tvnserver.exe", "vncserver.exe", "winvnc.exe"]),
                start_commands: templates(&[
                    ("tvnserver.exe", "{path} -start"),
                    ("winvnc.exe", "{path} -start"),
                ]),
                stop_commands: templates(&[
                    ("tvnserver.exe", "{path} -stop"),
                    ("winvnc.exe", "{path} -stop"),
                ]),
                default_start: "{path}".into(),
                default_stop: "taskkill /f /im {exe_name}".into(),
            }
        } else {
            Self {
                executables: strings(&["vncserver", "tigervncserver", "x11vnc"]),
                start_commands: templates(&[("x11vnc", "{path} -display :0 -bg -forever")]),
                stop_commands: templates(&[
                    ("vncserver", "{path} -kill :*"),
                    ("tigervncserver", "{path} -kill :*"),
                ]),
                default_start: "{path}".into(),
                default_stop: "pkill {exe_name}".into(),
            }
        }
    }

    pub fn default_rdp() -> Self {
        if cfg!(windows) {
            Self {
                executables: strings(&["net.exe"]),
                start_commands: BTreeMap::new(),
                stop_commands: BTreeMap::new(),
                default_start: "{path} start TermService".into(),
                default_stop: "{path} stop TermService /y".into(),
            }
        } else {
            Self {
                executables: strings(&["xrdp"]),
                start_commands: BTreeMap::new(),
                stop_commands: BTreeMap::new(),
                default_start: "sudo systemctl start xrdp".into(),
                default_stop: "sudo systemctl stop xrdp".into(),
            }
        }
    }

    fn start_template(&self, exe_name: &str) -> &str {
        self.start_commands
            .get(exe_name)
            .map(String::as_str)
            .unwrap_or(&self.default_start)
    }

    fn stop_template(&self, exe_name: &str) -> &str {
        self.stop_commands
            .get(exe_name)
            .map(String::as_str)
            .unwrap_or(&self.default_stop)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn templates(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Daemon-side settings file: viewer search lists and templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub vnc: ViewerConfig,
    pub rdp: ViewerConfig,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            vnc: ViewerConfig::default_vnc(),
            rdp: ViewerConfig::default_rdp(),
        }
    }
}

impl DaemonSettings {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// Finds executables by name.
pub trait ExecutableLocator: Send + Sync {
    fn find(&self, name: &str) -> Option<PathBuf>;
}

/// Looks an executable up on `PATH`, like `which`.
#[derive(Debug, Clone, Default)]
pub struct PathLocator;

impl ExecutableLocator for PathLocator {
    fn find(&self, name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
    }
}

/// Substitute `{path}` and `{exe_name}` in one pass. Other braces are kept.
pub fn render(template: &str, path: &str, exe_name: &str) -> String {
    let mut out = String::with_capacity(template.len() + path.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{path}") {
            out.push_str(&quote(path));
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{exe_name}") {
            out.push_str(&quote(exe_name));
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(windows)]
fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || "&|<>^()%!\"".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('"', ""))
    }
}

#[cfg(not(windows))]
fn quote(value: &str) -> String {
    crate::provisioner::command::shell_escape(value)
}

#[derive(Debug, Clone)]
struct RunningServer {
    path: String,
    exe_name: String,
}

/// One viewer's start/stop state machine: stopped until a start command
/// succeeds, running until a stop command succeeds.
pub struct SideChannel {
    kind: ViewerKind,
    config: ViewerConfig,
    locator: Arc<dyn ExecutableLocator>,
    running: Mutex<Option<RunningServer>>,
}

impl SideChannel {
    pub fn new(kind: ViewerKind, config: ViewerConfig, locator: Arc<dyn ExecutableLocator>) -> Self {
        Self {
            kind,
            config,
            locator,
            running: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ViewerKind {
        self.kind
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    fn locate(&self) -> Option<RunningServer> {
        self.config.executables.iter().find_map(|exe| {
            let path = self.locator.find(exe)?;
            let exe_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| exe.to_lowercase());
            Some(RunningServer {
                path: path.to_string_lossy().into_owned(),
                exe_name,
            })
        })
    }

    fn not_installed(&self) -> ActionResponse {
        ActionResponse::failed(format!(
            "No {} server found. Please install one of: {}",
            self.kind,
            self.config.executables.join(", ")
        ))
    }

    async fn run(&self, computer: &dyn Computer, command: String) -> Result<(), String> {
        tracing::info!(viewer = %self.kind, command = %command, "running side-channel command");
        computer
            .execute(Action::Command(CommandAction {
                command,
                timeout: Some(COMMAND_TIMEOUT_SECS),
            }))
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn start(&self, computer: &dyn Computer) -> ActionResponse {
        let mut running = self.running.lock().await;
        if let Some(server) = &*running {
            return ActionResponse::failed(format!(
                "{} server already running ({})",
                self.kind, server.path
            ));
        }

        let Some(server) = self.locate() else {
            return self.not_installed();
        };
        let command = render(
            self.config.start_template(&server.exe_name),
            &server.path,
            &server.exe_name,
        );

        match self.run(computer, command).await {
            Ok(()) => {
                let message = format!("{} server started successfully using {}", self.kind, server.path);
                *running = Some(server);
                ActionResponse::ok(message)
            }
            Err(e) => {
                tracing::warn!(viewer = %self.kind, error = %e, "side-channel start failed");
                ActionResponse::failed(format!("Failed to start {} server: {e}", self.kind))
            }
        }
    }

    /// Stops the server this daemon started, or the first installed one
    /// when it was started some other way.
    pub async fn stop(&self, computer: &dyn Computer) -> ActionResponse {
        let mut running = self.running.lock().await;
        let Some(server) = (*running).clone().or_else(|| self.locate()) else {
            return self.not_installed();
        };
        let command = render(
            self.config.stop_template(&server.exe_name),
            &server.path,
            &server.exe_name,
        );

        match self.run(computer, command).await {
            Ok(()) => {
                *running = None;
                ActionResponse::ok(format!("{} server stopped successfully", self.kind))
            }
            Err(e) => {
                tracing::warn!(viewer = %self.kind, error = %e, "side-channel stop failed");
                ActionResponse::failed(format!("Failed to stop {} server: {e}", self.kind))
            }
        }
    }
}
