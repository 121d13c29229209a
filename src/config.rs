//! Host configuration, the optional host defaults file, and local config paths

use crate::auth::Credentials;
use crate::discovery::DiscoveryAnnouncement;
use crate::protocol::DEFAULT_PORT;
use crate::sandbox;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};

pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("ct");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("ct");
    }
    PathBuf::from(".ct")
}

pub fn home_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(profile) = std::env::var("USERPROFILE") {
            return PathBuf::from(profile);
        }
    }
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

pub fn session_path() -> PathBuf {
    if let Ok(p) = std::env::var("CT_SESSION_FILE") {
        return PathBuf::from(p);
    }
    config_dir().join("session.json")
}

pub fn host_defaults_path() -> PathBuf {
    config_dir().join("host.toml")
}

/// Optional `host.toml`; every field may be omitted.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostDefaults {
    pub dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub write: Option<bool>,
    pub exec: Option<bool>,
    pub log_file: Option<PathBuf>,
}

impl HostDefaults {
    /// Missing file means "no defaults"; a present but malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("invalid host defaults in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }
}

/// Immutable per-run host configuration, shared read-only by every handler.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub sandbox_root: PathBuf,
    pub port: u16,
    pub credentials: Credentials,
    pub write_allowed: bool,
    pub readonly: bool,
    /// Serve the `/run` endpoint on this host
    pub exec_allowed: bool,
}

impl HostConfig {
    /// Validate and canonicalize the sandbox root. `readonly` is always the
    /// negation of `write_allowed`.
    pub fn new(
        sandbox_root: &Path,
        port: u16,
        credentials: Credentials,
        write_allowed: bool,
        exec_allowed: bool,
    ) -> Result<Self> {
        if !sandbox_root.exists() {
            bail!("Shared directory does not exist: {}", sandbox_root.display());
        }
        if !sandbox_root.is_dir() {
            bail!("Shared path is not a directory: {}", sandbox_root.display());
        }
        Ok(Self {
            sandbox_root: sandbox::canonical_root(sandbox_root),
            port,
            credentials,
            write_allowed,
            readonly: !write_allowed,
            exec_allowed,
        })
    }

    pub fn announcement(&self, ip: IpAddr) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            ip: ip.to_string(),
            port: self.port,
            token: self.credentials.token.clone(),
            write_allowed: self.write_allowed,
            name: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().into_owned()),
        }
    }
}

/// Settings the host command resolves from flags, then `host.toml`, then built-ins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub dir: PathBuf,
    pub port: u16,
    pub write: bool,
    pub exec: bool,
    pub log_file: Option<PathBuf>,
}

impl HostSettings {
    pub fn merge(
        dir: Option<PathBuf>,
        port: Option<u16>,
        write: Option<bool>,
        exec: bool,
        log_file: Option<PathBuf>,
        defaults: HostDefaults,
    ) -> Self {
        Self {
            dir: dir.or(defaults.dir).unwrap_or_else(home_dir),
            port: port.or(defaults.port).unwrap_or(DEFAULT_PORT),
            write: write.or(defaults.write).unwrap_or(false),
            exec: exec || defaults.exec.unwrap_or(false),
            log_file: log_file.or(defaults.log_file),
        }
    }
}

/// Address other LAN machines can reach us on. Connecting a UDP socket sends
/// nothing; it only asks the OS which interface would route there.
pub fn local_ip(bind: IpAddr) -> IpAddr {
    if !bind.is_unspecified() {
        return bind;
    }
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
