use crate::credentials::Credential;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name for persisted instance history, placed in the home directory
const DEFAULT_STATE_FILE_NAME: &str = ".speechgate_history.json";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Instance lifecycle settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Credentials rotated across provisioning attempts, in rotation order
    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// How new backends are obtained
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the client-facing API (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Client-facing port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the operator API, always bound on 127.0.0.1
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the operator API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Instances older than this are never reused (default: 8 hours)
    #[serde(default = "default_max_instance_age")]
    pub max_instance_age_secs: u64,

    /// Interval between keep-alive rounds (default: 50 minutes)
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Capability-listing path, used for health checks and voice listing
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Synthesis path on the backend
    #[serde(default = "default_speech_path")]
    pub speech_path: String,

    /// Timeout for a single health probe
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Timeout for forwarded synthesis requests
    #[serde(default = "default_speech_timeout")]
    pub speech_timeout_secs: u64,

    /// Timeout for forwarded voice listing requests
    #[serde(default = "default_voices_timeout")]
    pub voices_timeout_secs: u64,

    /// Wait budget for one provisioner call
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,

    /// Extra budget granted when no credential is available and an operator
    /// has to log in by hand
    #[serde(default = "default_manual_wait")]
    pub manual_wait_secs: u64,

    /// Backend resource class to request (e.g. an accelerator type)
    #[serde(default = "default_resource_preference")]
    pub resource_preference: String,

    /// Path of the persisted instance history. Unset means a file in the
    /// home directory; an empty string disables persistence.
    pub state_file: Option<String>,

    /// Also fail over to the next credential on generic provisioning failures,
    /// not only on resource exhaustion
    #[serde(default)]
    pub failover_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_instance_age_secs: default_max_instance_age(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            health_path: default_health_path(),
            speech_path: default_speech_path(),
            health_timeout_secs: default_health_timeout(),
            speech_timeout_secs: default_speech_timeout(),
            voices_timeout_secs: default_voices_timeout(),
            provision_timeout_secs: default_provision_timeout(),
            manual_wait_secs: default_manual_wait(),
            resource_preference: default_resource_preference(),
            state_file: None,
            failover_on_failure: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn max_instance_age(&self) -> Duration {
        Duration::from_secs(self.max_instance_age_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn speech_timeout(&self) -> Duration {
        Duration::from_secs(self.speech_timeout_secs)
    }

    pub fn voices_timeout(&self) -> Duration {
        Duration::from_secs(self.voices_timeout_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn manual_wait(&self) -> Duration {
        Duration::from_secs(self.manual_wait_secs)
    }

    /// Resolve where instance history is persisted, if anywhere
    pub fn state_file_path(&self) -> Option<PathBuf> {
        match self.state_file.as_deref() {
            Some("") => None,
            Some(path) => Some(expand_home(path)),
            None => dirs_next::home_dir().map(|home| home.join(DEFAULT_STATE_FILE_NAME)),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Provisioner kind
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerType {
    /// Operator hands in the tunnel address through the admin API (default)
    #[default]
    Manual,
    /// External program drives the provisioning session
    Command,
}

/// Configuration for obtaining new backends
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution, and the
/// program receives credential secrets in its environment. Configuration files
/// must be readable only by the service user.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvisionerConfig {
    #[serde(default, rename = "type")]
    pub provisioner_type: ProvisionerType,

    /// Program to run (command only). Split with shell rules when `args` is empty.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables for the command
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProvisionerConfig {
    pub fn command(command: &str) -> Self {
        Self {
            provisioner_type: ProvisionerType::Command,
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Program and arguments to execute
    pub fn program(&self) -> anyhow::Result<(String, Vec<String>)> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Command provisioner requires 'command' field"))?;

        if !self.args.is_empty() {
            return Ok((command.to_string(), self.args.clone()));
        }

        let mut words = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid provisioner command '{}': {}", command, e))?;
        if words.is_empty() {
            anyhow::bail!("Provisioner command is empty");
        }
        let program = words.remove(0);
        Ok((program, words))
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8081
}

fn default_max_instance_age() -> u64 {
    8 * 60 * 60
}

fn default_keep_alive_interval() -> u64 {
    50 * 60
}

fn default_health_path() -> String {
    "/v1/audio/voices".to_string()
}

fn default_speech_path() -> String {
    "/v1/audio/speech".to_string()
}

fn default_health_timeout() -> u64 {
    5
}

fn default_speech_timeout() -> u64 {
    60
}

fn default_voices_timeout() -> u64 {
    10
}

fn default_provision_timeout() -> u64 {
    600
}

fn default_manual_wait() -> u64 {
    120
}

fn default_resource_preference() -> String {
    "T4".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.name.trim().is_empty() {
                anyhow::bail!("Credential names must not be empty");
            }
            if !seen.insert(credential.name.as_str()) {
                anyhow::bail!("Duplicate credential name '{}'", credential.name);
            }
        }

        if self.provisioner.provisioner_type == ProvisionerType::Command {
            self.provisioner.program()?;
        }

        let orchestrator = &self.orchestrator;
        for (name, value) in [
            ("max_instance_age_secs", orchestrator.max_instance_age_secs),
            ("keep_alive_interval_secs", orchestrator.keep_alive_interval_secs),
            ("health_timeout_secs", orchestrator.health_timeout_secs),
            ("speech_timeout_secs", orchestrator.speech_timeout_secs),
            ("voices_timeout_secs", orchestrator.voices_timeout_secs),
            ("provision_timeout_secs", orchestrator.provision_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("orchestrator.{} must be greater than zero", name);
            }
        }

        for (name, path) in [
            ("health_path", &orchestrator.health_path),
            ("speech_path", &orchestrator.speech_path),
        ] {
            if !path.starts_with('/') {
                anyhow::bail!("orchestrator.{} must start with '/'", name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 9090
admin_port = 9091
admin_token = "secret-token"

[orchestrator]
max_instance_age_secs = 3600
keep_alive_interval_secs = 600
resource_preference = "V100"
state_file = "/tmp/history.json"
failover_on_failure = true

[[credentials]]
name = "Primary"
username = "first@example.com"
secret = "one"

[[credentials]]
name = "Secondary"
secret = "two"

[provisioner]
type = "command"
command = "./provision.sh"
args = ["--headless"]

[provisioner.env]
DISPLAY = ":99"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.admin_port, 9091);
        assert_eq!(config.server.admin_token, Some("secret-token".to_string()));

        assert_eq!(config.orchestrator.max_instance_age(), Duration::from_secs(3600));
        assert_eq!(config.orchestrator.keep_alive_interval(), Duration::from_secs(600));
        assert_eq!(config.orchestrator.resource_preference, "V100");
        assert!(config.orchestrator.failover_on_failure);
        assert_eq!(
            config.orchestrator.state_file_path(),
            Some(PathBuf::from("/tmp/history.json"))
        );

        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials[0].name, "Primary");
        assert_eq!(config.credentials[0].username.as_deref(), Some("first@example.com"));
        assert_eq!(config.credentials[1].username, None);

        assert_eq!(config.provisioner.provisioner_type, ProvisionerType::Command);
        assert_eq!(config.provisioner.env.get("DISPLAY"), Some(&":99".to_string()));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 8081);
        assert_eq!(config.orchestrator.max_instance_age_secs, 8 * 60 * 60);
        assert_eq!(config.orchestrator.keep_alive_interval_secs, 50 * 60);
        assert_eq!(config.orchestrator.health_path, "/v1/audio/voices");
        assert_eq!(config.orchestrator.speech_path, "/v1/audio/speech");
        assert_eq!(config.orchestrator.manual_wait(), Duration::from_secs(120));
        assert!(config.credentials.is_empty());
        assert_eq!(config.provisioner.provisioner_type, ProvisionerType::Manual);
    }

    #[test]
    fn test_keep_alive_shorter_than_max_age_by_default() {
        let orchestrator = OrchestratorConfig::default();
        assert!(orchestrator.keep_alive_interval() < orchestrator.max_instance_age());
    }

    #[test]
    fn test_empty_state_file_disables_persistence() {
        let orchestrator = OrchestratorConfig {
            state_file: Some(String::new()),
            ..OrchestratorConfig::default()
        };
        assert_eq!(orchestrator.state_file_path(), None);
    }

    #[test]
    fn test_duplicate_credential_names_rejected() {
        let toml = r#"
[[credentials]]
name = "A"
secret = "1"

[[credentials]]
name = "A"
secret = "2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate credential name"));
    }

    #[test]
    fn test_command_provisioner_requires_command() {
        let toml = r#"
[provisioner]
type = "command"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_command_split_with_shell_rules() {
        let config = ProvisionerConfig::command("python3 'drive session.py' --gpu T4");
        let (program, args) = config.program().unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["drive session.py", "--gpu", "T4"]);
    }

    #[test]
    fn test_explicit_args_win_over_splitting() {
        let mut config = ProvisionerConfig::command("/opt/provision");
        config.args = vec!["--verbose".to_string()];
        let (program, args) = config.program().unwrap();
        assert_eq!(program, "/opt/provision");
        assert_eq!(args, vec!["--verbose"]);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let toml = r#"
[orchestrator]
health_timeout_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
