//! Daemon configuration.
//!
//! Settings come from an optional JSON file (`--config`) with command-line
//! flags layered on top. Scalar flags override the file; `--project` and
//! `--peer` add to the lists from the file.

use clap::Parser;
use resync_core::protocol::Credentials;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid project '{0}', expected ID=PATH")]
    ProjectSpec(String),

    #[error("project '{0}' is configured more than once")]
    DuplicateProject(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug, Default)]
#[command(name = "resync-daemon")]
#[command(about = "Replicate project directories between peers over WebSocket")]
pub struct CliArgs {
    /// Path to a JSON config file
    #[arg(short, long, env = "RESYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to accept peer connections on (e.g. 0.0.0.0:9427)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Project to synchronize, as ID=PATH (repeatable)
    #[arg(short, long = "project", value_name = "ID=PATH")]
    pub projects: Vec<ProjectConfig>,

    /// Peer to connect to, as ws://host:port (repeatable)
    #[arg(long = "peer", value_name = "URL")]
    pub peers: Vec<String>,

    /// Channel identity sent when joining
    #[arg(long)]
    pub identity: Option<String>,

    /// Opaque token sent when joining
    #[arg(long, env = "RESYNC_TOKEN")]
    pub token: Option<String>,

    /// Seconds an outstanding resource request stays valid
    #[arg(long)]
    pub request_ttl_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// One synchronized project: an id shared by all peers and a local root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub root: PathBuf,
}

impl FromStr for ProjectConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((id, root)) if !id.trim().is_empty() && !root.trim().is_empty() => Ok(Self {
                id: id.trim().to_string(),
                root: PathBuf::from(root.trim()),
            }),
            _ => Err(ConfigError::ProjectSpec(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listen address; `None` runs as a client only
    pub listen: Option<String>,
    pub projects: Vec<ProjectConfig>,
    pub peers: Vec<String>,
    pub identity: String,
    pub token: Option<String>,
    pub request_ttl_secs: u64,
    pub verbose: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: None,
            projects: Vec::new(),
            peers: Vec::new(),
            identity: "resync".to_string(),
            token: None,
            request_ttl_secs: 60,
            verbose: false,
        }
    }
}

impl DaemonConfig {
    /// Read a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the effective configuration from parsed flags.
    ///
    /// Relative paths, including the config file itself, are resolved
    /// against `cwd`.
    pub fn from_args(args: CliArgs, cwd: &Path) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(&absolutize(path, cwd))?,
            None => Self::default(),
        };

        if args.listen.is_some() {
            config.listen = args.listen;
        }
        config.projects.extend(args.projects);
        config.peers.extend(args.peers);
        if let Some(identity) = args.identity {
            config.identity = identity;
        }
        if args.token.is_some() {
            config.token = args.token;
        }
        if let Some(ttl) = args.request_ttl_secs {
            config.request_ttl_secs = ttl;
        }
        config.verbose |= args.verbose;

        config.resolve(cwd)?;
        Ok(config)
    }

    /// Expand and absolutize project roots and check the result is usable.
    pub fn resolve(&mut self, cwd: &Path) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("identity must not be empty".into()));
        }
        if self.request_ttl_secs == 0 {
            return Err(ConfigError::Invalid("request_ttl_secs must be positive".into()));
        }

        let mut seen = HashSet::new();
        for project in &mut self.projects {
            if project.id.is_empty() {
                return Err(ConfigError::Invalid("project id must not be empty".into()));
            }
            if !seen.insert(project.id.clone()) {
                return Err(ConfigError::DuplicateProject(project.id.clone()));
            }
            project.root = absolutize(&expand_tilde(&project.root), cwd);
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        let credentials = Credentials::new(self.identity.clone());
        match &self.token {
            Some(token) => credentials.with_token(token.clone()),
            None => credentials,
        }
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
