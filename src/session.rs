//! Persisted client session: which host this machine joined, the credentials,
//! the remote working directory and the clipboard slot.
//!
//! One session per machine. Every verb loads it, and verbs that change it
//! write it back atomically (temp file + rename), so a crash mid-save never
//! leaves a half-written session behind.

use crate::client::{self, RemoteClient};
use crate::error::{CtError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    #[serde(rename = "ip")]
    pub host_ip: String,
    #[serde(rename = "port")]
    pub host_port: u16,
    pub token: String,
    pub password: String,
    /// Sandbox-relative, `/`-separated, no leading slash; empty is the root
    #[serde(default)]
    pub cur_path: String,
    #[serde(default)]
    pub clipboard: Option<PathBuf>,
    /// Taken from the discovery announcement; manual joins assume true
    #[serde(default = "default_true")]
    pub write_allowed: bool,
}

impl ClientSession {
    pub fn new(
        host_ip: &str,
        host_port: u16,
        token: &str,
        password: &str,
        write_allowed: bool,
    ) -> Self {
        Self {
            host_ip: host_ip.to_string(),
            host_port,
            token: token.to_string(),
            password: password.to_string(),
            cur_path: String::new(),
            clipboard: None,
            write_allowed,
        }
    }

    pub fn client(&self) -> Result<RemoteClient> {
        RemoteClient::new(&self.host_ip, self.host_port, &self.token, &self.password)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host_ip, self.host_port)
    }

    /// Remote working directory as shown to the user.
    pub fn display_path(&self) -> String {
        client::display(&self.cur_path)
    }

    /// Sandbox-relative path of `name` taken from the remote working directory.
    pub fn remote_path(&self, name: &str) -> String {
        join_logical(&self.cur_path, name)
    }
}

/// Apply `target` to the logical path `base`. A leading separator starts from
/// the root; `..` stops at the root instead of failing. The host still
/// resolves the result against its own sandbox.
pub fn join_logical(base: &str, target: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if !target.starts_with(['/', '\\']) {
        parts.extend(base.split('/').filter(|p| !p.is_empty()));
    }
    for part in target.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    parts.join("/")
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ClientSession>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load, failing with `NotConnected` when no session exists.
    pub fn require(&self) -> Result<ClientSession> {
        self.load()?.ok_or(CtError::NotConnected)
    }

    pub fn save(&self, session: &ClientSession) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staged, session)?;
        staged.flush()?;
        staged.persist(&self.path).map_err(|e| CtError::Io(e.error))?;
        Ok(())
    }

    /// Remove the session, returning what was removed.
    pub fn clear(&self) -> Result<Option<ClientSession>> {
        // A corrupt file is still removed; there is nothing to report about it
        let previous = self.load().unwrap_or(None);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(previous),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
