//! Server configuration: TOML file + CLI overrides.

use cvm_core::{CvmError, CvmResult, RegionEncoding};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub vm: Vec<VmSection>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub verbose: bool,
    /// Seconds between IP data sweeps.
    #[serde(default = "default_ip_sweep_interval")]
    pub ip_sweep_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            verbose: false,
            ip_sweep_interval: default_ip_sweep_interval(),
        }
    }
}

/// `[display]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySection {
    #[serde(default)]
    pub encoding: RegionEncoding,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            encoding: RegionEncoding::default(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// One `[[vm]]` entry of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSection {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_vnc_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_listen() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    6004
}
fn default_ip_sweep_interval() -> u64 {
    5
}
fn default_jpeg_quality() -> u32 {
    75
}
fn default_vnc_port() -> u16 {
    5900
}
fn default_retry_count() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// Resolved VM entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub retry_count: u32,
    pub autostart: bool,
}

/// Resolved display settings shared by every VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    pub encoding: RegionEncoding,
    /// JPEG quality, already clamped to 0..=100.
    pub jpeg_quality: u8,
}

/// Values given on the command line. `None`/`false` leaves the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub listen: Option<IpAddr>,
    pub encoding: Option<String>,
    pub jpeg_quality: Option<u32>,
    pub verbose: bool,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub verbose: bool,
    pub ip_sweep_interval: Duration,
    pub display: DisplayConfig,
    pub vms: Vec<VmConfig>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> CvmResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> CvmResult<Self> {
        let listen_ip = cli.listen.unwrap_or(file.server.listen);
        let port = cli.port.unwrap_or(file.server.port);

        if file.server.ip_sweep_interval == 0 {
            return Err(CvmError::Config("ip_sweep_interval must be at least 1 second".into()));
        }

        let encoding = match cli.encoding.as_deref() {
            Some(name) => parse_encoding(name)?,
            None => file.display.encoding,
        };
        let quality = cli.jpeg_quality.unwrap_or(file.display.jpeg_quality).min(100);

        let mut seen = HashSet::new();
        let mut vms = Vec::with_capacity(file.vm.len());
        for entry in file.vm {
            if entry.id.trim().is_empty() {
                return Err(CvmError::Config("vm id must not be empty".into()));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(CvmError::Config(format!("duplicate vm id: {}", entry.id)));
            }
            vms.push(VmConfig {
                name: entry.name.unwrap_or_else(|| entry.id.clone()),
                id: entry.id,
                host: entry.host,
                port: entry.port,
                password: entry.password,
                retry_count: entry.retry_count,
                autostart: entry.autostart,
            });
        }

        Ok(Self {
            listen: SocketAddr::new(listen_ip, port),
            verbose: cli.verbose || file.server.verbose,
            ip_sweep_interval: Duration::from_secs(file.server.ip_sweep_interval),
            display: DisplayConfig {
                encoding,
                jpeg_quality: quality as u8,
            },
            vms,
        })
    }
}

fn parse_file(content: &str) -> CvmResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| CvmError::Config(format!("config parse error: {e}")))
}

fn parse_encoding(name: &str) -> CvmResult<RegionEncoding> {
    match name.to_ascii_lowercase().as_str() {
        "png" => Ok(RegionEncoding::Png),
        "jpeg" | "jpg" => Ok(RegionEncoding::Jpeg),
        other => Err(CvmError::Config(format!("unknown encoding: {other}"))),
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
