//! Remote command execution fallback.
//!
//! Hosts started with `--exec` answer `/run` directly. For hosts that did
//! not, the client drops an activation manifest into the share and a
//! host-side watcher (`ct-runner`) picks it up and opens an execution
//! listener on the requested port, authenticated with the same credentials.
//! The client never starts anything on the host itself.

use crate::auth::{self, Credentials};
use crate::client::RemoteClient;
use crate::config::HostConfig;
use crate::error::{CtError, Result};
use crate::logger::Logger;
use crate::protocol::RUNNER_MANIFEST;
use crate::service::RunOutput;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerManifest {
    pub port: u16,
    pub token: String,
    pub password_hash: String,
}

impl RunnerManifest {
    pub fn for_client(client: &RemoteClient, port: u16) -> Self {
        Self {
            port,
            token: client.token().to_string(),
            password_hash: auth::digest(client.password()),
        }
    }

    fn is_valid(&self) -> bool {
        self.port != 0
            && !self.token.is_empty()
            && self.password_hash.len() == 64
            && self.password_hash.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn host_config(&self, dir: &Path) -> anyhow::Result<HostConfig> {
        let credentials = Credentials {
            token: self.token.clone(),
            password_hash: self.password_hash.to_ascii_lowercase(),
        };
        HostConfig::new(dir, self.port, credentials, false, true)
    }
}

/// Where the command ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVia {
    Host,
    ExecListener(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct Activation {
    pub exec_port: u16,
    pub polls: u32,
    pub interval: Duration,
}

/// Run `command` on the host, activating an execution listener if the host
/// itself does not serve `/run`.
pub async fn run_remote(
    client: &RemoteClient,
    command: &str,
    activation: Activation,
) -> Result<(RunOutput, RunVia)> {
    match client.run(command).await {
        Ok(out) => return Ok((out, RunVia::Host)),
        Err(CtError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    // Only ask for the command once something listens, so a request that was
    // sent but failed is never repeated
    let exec = client.at_port(activation.exec_port);
    let via = RunVia::ExecListener(activation.exec_port);
    // A listener from an earlier activation may already be up
    if exec.reachable().await {
        match exec.run(command).await {
            Ok(out) => return Ok((out, via)),
            Err(CtError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let manifest = RunnerManifest::for_client(client, activation.exec_port);
    let bytes = serde_json::to_vec(&manifest)?;
    client.upload("", RUNNER_MANIFEST, bytes).await?;

    for _ in 0..activation.polls {
        tokio::time::sleep(activation.interval).await;
        if exec.reachable().await {
            return exec.run(command).await.map(|out| (out, via));
        }
    }
    Err(CtError::Connection(format!(
        "no execution listener answered on port {}; the host must run `ct-runner --dir <shared dir>`",
        activation.exec_port
    )))
}

/// Read and consume a manifest in `dir`, if one is present. Malformed
/// manifests are removed and reported.
pub fn take_manifest(dir: &Path) -> anyhow::Result<Option<RunnerManifest>> {
    let path = dir.join(RUNNER_MANIFEST);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    std::fs::remove_file(&path)?;
    let manifest: RunnerManifest = serde_json::from_slice(&bytes)?;
    if !manifest.is_valid() {
        anyhow::bail!("activation manifest has invalid fields");
    }
    Ok(Some(manifest))
}

/// Poll `dir` until a valid manifest shows up.
pub async fn wait_for_manifest(
    dir: &Path,
    interval: Duration,
    logger: &dyn Logger,
) -> RunnerManifest {
    loop {
        match take_manifest(dir) {
            Ok(Some(m)) => return m,
            Ok(None) => {}
            Err(e) => logger.error("runner", RUNNER_MANIFEST, &e.to_string()),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_host::{FakeHost, Reply};
    use crate::logger::NoopLogger;
    use tempfile::TempDir;

    fn quick_activation(exec_port: u16) -> Activation {
        Activation {
            exec_port,
            polls: 3,
            interval: Duration::from_millis(10),
        }
    }

    fn manifest() -> RunnerManifest {
        RunnerManifest {
            port: 8765,
            token: "tok".into(),
            password_hash: auth::digest("pw"),
        }
    }

    #[test]
    fn take_manifest_consumes_the_file() {
        let tmp = TempDir::new().unwrap();
        assert!(take_manifest(tmp.path()).unwrap().is_none());

        std::fs::write(
            tmp.path().join(RUNNER_MANIFEST),
            serde_json::to_vec(&manifest()).unwrap(),
        )
        .unwrap();
        assert_eq!(take_manifest(tmp.path()).unwrap(), Some(manifest()));
        assert!(!tmp.path().join(RUNNER_MANIFEST).exists());
    }

    #[test]
    fn malformed_manifest_is_removed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(RUNNER_MANIFEST);
        std::fs::write(&path, br#"{"port":0,"token":"","password_hash":"zz"}"#).unwrap();
        assert!(take_manifest(tmp.path()).is_err());
        assert!(!path.exists());

        std::fs::write(&path, b"not json").unwrap();
        assert!(take_manifest(tmp.path()).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn manifest_credentials_authorize_the_client() {
        let tmp = TempDir::new().unwrap();
        let cfg = manifest().host_config(tmp.path()).unwrap();
        assert!(cfg.exec_allowed);
        assert!(!cfg.write_allowed);
        assert!(auth::authorize(&cfg, "tok", "pw"));
        assert!(!auth::authorize(&cfg, "tok", "nope"));
    }

    #[tokio::test]
    async fn wait_for_manifest_picks_up_late_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        let writer = {
            let dir = dir.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let staged = dir.join("staged.json");
                std::fs::write(&staged, serde_json::to_vec(&manifest()).unwrap()).unwrap();
                std::fs::rename(&staged, dir.join(RUNNER_MANIFEST)).unwrap();
            })
        };
        let got = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_manifest(&dir, Duration::from_millis(10), &NoopLogger),
        )
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(got, manifest());
    }

    #[tokio::test]
    async fn failed_exec_request_is_not_repeated() {
        // The host has no /run; the exec listener takes the request and drops it
        let host = FakeHost::start(vec![Reply::Status(404)]).await;
        let exec = FakeHost::start(vec![Reply::Hangup]).await;
        let client = RemoteClient::new("127.0.0.1", host.port, "tok", "pw").unwrap();

        let err = run_remote(&client, "echo once", quick_activation(exec.port))
            .await
            .unwrap_err();
        assert!(matches!(err, CtError::Connection(_)), "unexpected error: {err:?}");
        assert_eq!(exec.hits(), 1);
        // no manifest upload after the exec request went out
        assert_eq!(host.hits(), 1);
    }

    #[tokio::test]
    async fn missing_listener_uploads_manifest_then_gives_up() {
        let host = FakeHost::start(vec![Reply::Status(404), Reply::Status(200)]).await;
        let closed = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let client = RemoteClient::new("127.0.0.1", host.port, "tok", "pw").unwrap();

        let err = run_remote(&client, "echo hi", quick_activation(closed))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ct-runner"), "unexpected error: {err}");
        assert_eq!(host.hits(), 2);
    }
}
