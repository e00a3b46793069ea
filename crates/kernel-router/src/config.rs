use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Comm target the kernel-side client opens.
pub const DEFAULT_CHANNEL_NAME: &str = "FFBOLab:Dump-data";

/// Kernel variable holding the kernel-side client.
pub const DEFAULT_CLIENT_VARIABLE: &str = "_FFBOLABClient";

/// Python run in the kernel to open the side-channel. `{channel}` is
/// replaced with the channel name.
pub const DEFAULT_BOOTSTRAP_TEMPLATE: &str = r#"from ipykernel.comm import Comm
_FFBOLabcomm = Comm(target_name="{channel}")
_FFBOLabcomm.send(data="FFBOLab comm established")
_FFBOLabcomm.send(data="Generating FFBOLab Client...")
import flybrainlab as fbl
_FFBOLABClient = fbl.ffbolabClient(FFBOLabcomm = _FFBOLabcomm)
nm = _FFBOLABClient
"#;

/// Router settings, read from a JSON file. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Prefix of the session title.
    pub label: String,
    pub channel_name: String,
    pub bootstrap_template: String,
    /// How long the bootstrap may run before the registration is abandoned.
    pub bootstrap_timeout_ms: u64,
    pub client_variable: String,
    /// Document used when no path is given. `None` asks the document provider.
    pub default_path: Option<String>,
    pub session_name: String,
    /// Kernelspec to launch.
    pub kernel_name: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            label: "Master".to_string(),
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            bootstrap_template: DEFAULT_BOOTSTRAP_TEMPLATE.to_string(),
            bootstrap_timeout_ms: 120_000,
            client_variable: DEFAULT_CLIENT_VARIABLE.to_string(),
            default_path: None,
            session_name: "FFBOLab".to_string(),
            kernel_name: "python3".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
}

/// Default location of the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-router")
        .join("config.json")
}

/// Load config from `path`, returning defaults if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<RouterConfig> {
    if !path.exists() {
        return Ok(RouterConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Invalid config {}", path.display()))
}

/// Write config to `path`, creating parent directories.
pub fn save_config(path: &Path, config: &RouterConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}
