//! Service configuration.
//!
//! Read once at startup from a YAML file (default `shipwright.yml`). The
//! project list is fixed for the process lifetime.
//!
//! # Configuration File Format
//!
//! ```yaml
//! http:
//!   ip: 0.0.0.0
//!   port: 8080
//! log_file: /var/log/shipwright/shipwright.log
//! runtime:
//!   refresh_interval_secs: 10
//!   send_timeout_ms: 1000
//!   command_capacity: 1024
//!   worker_capacity: 1024
//!   svn_update_interval_secs: 10
//! projects:
//!   - project_name: helix
//!     scripts_path: /opt/shipwright/scripts/
//!     git:
//!       work_dir: /srv/helix/git
//!     svn:
//!       username: builder
//!       password: secret
//!       work_dir: /srv/helix/svn
//!       url: svn.internal
//!       port: 3690
//!       remote_dir: helix/trunk
//!     ftp:
//!       username: drop
//!       password: secret
//!       work_dir: /releases/helix
//!       host: ftp.internal
//!       port: 21
//!       timeout: 30
//!     oss:
//!       end_point: oss-cn-shanghai.aliyuncs.com
//!       bucket_name: helix-notice
//!       access_key_id: LTAI...
//!       access_key_secret: secret
//!       proxy_url: https://notice.example.com
//!       envs:
//!         - name: dev
//!           value: helix-dev
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "shipwright.yml";

const GIT_SCRIPT_NAME: &str = "git.sh";
const SVN_SCRIPT_NAME: &str = "svn.sh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    /// When set, logs also go to a daily-rolling file with this path's name.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
        }
    }
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Timing and capacity knobs shared by every project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_capacity")]
    pub command_capacity: usize,
    #[serde(default = "default_capacity")]
    pub worker_capacity: usize,
    #[serde(default = "default_refresh_interval_secs")]
    pub svn_update_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            command_capacity: default_capacity(),
            worker_capacity: default_capacity(),
            svn_update_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn svn_update_interval(&self) -> Duration {
        Duration::from_secs(self.svn_update_interval_secs)
    }
}

fn default_refresh_interval_secs() -> u64 {
    10
}

fn default_send_timeout_ms() -> u64 {
    1000
}

fn default_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_name: String,
    /// Directory holding `git.sh` and `svn.sh`.
    pub scripts_path: PathBuf,
    pub git: GitConfig,
    pub svn: SvnConfig,
    pub ftp: FtpConfig,
    #[serde(default)]
    pub oss: OssConfig,
}

impl ProjectConfig {
    pub fn git_script(&self) -> PathBuf {
        self.scripts_path.join(GIT_SCRIPT_NAME)
    }

    pub fn svn_script(&self) -> PathBuf {
        self.scripts_path.join(SVN_SCRIPT_NAME)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub work_dir: PathBuf,
    pub url: String,
    #[serde(default = "default_svn_port")]
    pub port: u16,
    #[serde(default)]
    pub remote_dir: String,
}

impl SvnConfig {
    /// `svn://user@host:port/remote_dir`
    pub fn repository_url(&self) -> String {
        format!(
            "svn://{}@{}:{}/{}",
            self.username,
            self.url,
            self.port,
            self.remote_dir.trim_start_matches('/')
        )
    }
}

fn default_svn_port() -> u16 {
    3690
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    #[serde(default = "default_ftp_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_ftp_work_dir")]
    pub work_dir: String,
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    /// Connect timeout in seconds.
    #[serde(default = "default_ftp_timeout")]
    pub timeout: u64,
    /// File name prefix of uploaded archives.
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,
}

fn default_ftp_username() -> String {
    "anonymous".to_string()
}

fn default_ftp_work_dir() -> String {
    "/".to_string()
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_timeout() -> u64 {
    30
}

fn default_artifact_prefix() -> String {
    "HelixServer".to_string()
}

/// Object storage holding the release notice pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OssConfig {
    #[serde(default)]
    pub end_point: String,
    #[serde(default)]
    pub bucket_name: String,
    /// Requests are signed when set; left empty the bucket must be public.
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub access_key_secret: String,
    #[serde(default)]
    pub proxy_url: String,
    #[serde(default)]
    pub envs: Vec<OssEnv>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OssEnv {
    pub name: String,
    pub value: String,
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.projects.is_empty() {
            anyhow::bail!("At least one project must be configured");
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            let name = project.project_name.as_str();
            if name.trim().is_empty() {
                anyhow::bail!("Project names must not be empty");
            }
            if name.trim() != name {
                anyhow::bail!("Project name '{}' has leading or trailing whitespace", name);
            }
            if !seen.insert(name) {
                anyhow::bail!("Project '{}' is configured more than once", name);
            }
        }

        let rt = &self.runtime;
        if rt.refresh_interval_secs == 0 || rt.svn_update_interval_secs == 0 {
            anyhow::bail!("Refresh intervals must be at least one second");
        }
        if rt.send_timeout_ms == 0 {
            anyhow::bail!("send_timeout_ms must be greater than zero");
        }
        if rt.command_capacity == 0 || rt.worker_capacity == 0 {
            anyhow::bail!("Queue capacities must be greater than zero");
        }
        Ok(())
    }

    pub fn project_names(&self) -> Vec<&str> {
        self.projects.iter().map(|p| p.project_name.as_str()).collect()
    }
}
