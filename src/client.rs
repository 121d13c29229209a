//! Typed calls against a CT host.
//!
//! Every request carries the token and password headers. Reads have a
//! retry policy for dropped connections; writes are sent exactly once.
//! Per-operation limits bound inactivity (waiting for the response head or
//! the next body chunk), so a slow transfer that keeps moving never times out.

use crate::error::{CtError, Result};
use crate::progress::TransferProgress;
use crate::protocol::{endpoint, timeouts, PASSWORD_HEADER, TOKEN_HEADER};
use crate::service::{DirEntry, RunOutput, RunRequest};
use reqwest::{Method, RequestBuilder, Response};
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    host: String,
    port: u16,
    token: String,
    password: String,
    retry_backoff: Duration,
    read_limit: Option<Duration>,
}

fn transport_err(e: reqwest::Error, limit: Duration) -> CtError {
    if e.is_timeout() {
        CtError::Timeout(limit)
    } else {
        CtError::Connection(e.to_string())
    }
}

/// Await one step of a request, failing with `Timeout` if it stalls past `limit`.
async fn within<T, F>(limit: Duration, step: F) -> Result<T>
where
    F: Future<Output = reqwest::Result<T>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(r) => r.map_err(|e| transport_err(e, limit)),
        Err(_) => Err(CtError::Timeout(limit)),
    }
}

impl RemoteClient {
    pub fn new(host: &str, port: u16, token: &str, password: &str) -> Result<Self> {
        // Hosts are on the LAN; environment proxies must not intercept them
        let http = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(timeouts::CONNECT)
            .build()
            .map_err(|e| CtError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            host: host.to_string(),
            port,
            token: token.to_string(),
            password: password.to_string(),
            retry_backoff: timeouts::RETRY_BACKOFF,
            read_limit: None,
        })
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Cap every per-operation inactivity limit at `limit`.
    pub fn with_read_limit(mut self, limit: Duration) -> Self {
        self.read_limit = Some(limit);
        self
    }

    fn limit(&self, op: Duration) -> Duration {
        self.read_limit.map_or(op, |cap| cap.min(op))
    }

    /// Same host and credentials on a different port.
    pub fn at_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Whether anything accepts TCP connections on our port.
    pub async fn reachable(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        matches!(tokio::time::timeout(timeouts::CONNECT, connect).await, Ok(Ok(_)))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("http://{}:{}{}", self.host, self.port, path))
            .header(TOKEN_HEADER, &self.token)
            .header(PASSWORD_HEADER, &self.password)
    }

    /// Send and wait at most `limit` for the response head; non-success
    /// statuses become taxonomy errors naming `what` (the sandbox-relative
    /// path the caller asked for).
    async fn send(&self, rb: RequestBuilder, limit: Duration, what: &str) -> Result<Response> {
        let resp = within(limit, rb.send()).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = within(limit, resp.text()).await.unwrap_or_default();
        Err(CtError::from_status(status.as_u16(), what, body))
    }

    pub async fn list(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let rb = self.request(Method::GET, endpoint::LIST).query(&[("path", rel)]);
        let limit = self.limit(timeouts::LIST);
        let resp = self.send(rb, limit, &display(rel)).await?;
        let body = within(limit, resp.bytes()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Download `rel` into `dest`, retrying dropped connections up to the
    /// attempt limit with a fixed back-off. Data is staged in a temp file next
    /// to `dest`, so a failed transfer never leaves a partial file behind.
    pub async fn download_to(
        &self,
        rel: &str,
        dest: &Path,
        progress: &TransferProgress,
    ) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match self.download_once(rel, dest, progress).await {
                Ok(n) => return Ok(n),
                Err(e) if e.is_transient() && attempt < timeouts::DOWNLOAD_ATTEMPTS => {
                    progress.note(&format!(
                        "connection dropped, retrying in {}s ({}/{})",
                        self.retry_backoff.as_secs(),
                        attempt,
                        timeouts::DOWNLOAD_ATTEMPTS
                    ));
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        rel: &str,
        dest: &Path,
        progress: &TransferProgress,
    ) -> Result<u64> {
        let limit = self.limit(timeouts::DOWNLOAD);
        let rb = self.request(Method::GET, endpoint::DOWNLOAD).query(&[("path", rel)]);
        let mut resp = self.send(rb, limit, &display(rel)).await?;
        progress.start(resp.content_length());

        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        let mut written = 0u64;
        while let Some(chunk) = within(limit, resp.chunk()).await? {
            staged.write_all(&chunk)?;
            written += chunk.len() as u64;
            progress.advance(chunk.len() as u64);
        }
        staged.flush()?;
        staged.persist(dest).map_err(|e| CtError::Io(e.error))?;
        Ok(written)
    }

    pub async fn upload(&self, rel_dir: &str, filename: &str, bytes: Vec<u8>) -> Result<()> {
        let deadline = self.limit(timeouts::upload_deadline(bytes.len()));
        let rb = self
            .request(Method::POST, endpoint::UPLOAD)
            .query(&[("path", rel_dir), ("filename", filename)])
            .body(bytes);
        self.send(rb, deadline, &display(rel_dir)).await?;
        Ok(())
    }

    pub async fn mkdir(&self, rel: &str) -> Result<()> {
        let rb = self.request(Method::POST, endpoint::MKDIR).query(&[("path", rel)]);
        self.send(rb, self.limit(timeouts::MKDIR), &display(rel)).await?;
        Ok(())
    }

    pub async fn delete(&self, rel: &str) -> Result<()> {
        let rb = self.request(Method::DELETE, endpoint::DELETE).query(&[("path", rel)]);
        self.send(rb, self.limit(timeouts::DELETE), &display(rel)).await?;
        Ok(())
    }

    /// `NotFound` here means the host does not serve `/run` at all.
    pub async fn run(&self, command: &str) -> Result<RunOutput> {
        let rb = self.request(Method::POST, endpoint::RUN).json(&RunRequest {
            command: command.to_string(),
        });
        let limit = self.limit(timeouts::RUN);
        let resp = self.send(rb, limit, endpoint::RUN).await?;
        let body = within(limit, resp.bytes()).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Sandbox-relative path as users see it: always rooted at `/`.
pub fn display(rel: &str) -> String {
    format!("/{}", rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_host::{FakeHost, Reply};

    #[test]
    fn display_is_rooted() {
        assert_eq!(display(""), "/");
        assert_eq!(display("a/b.txt"), "/a/b.txt");
        assert_eq!(display("/a"), "/a");
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        // Reserve a port, then release it so nothing is listening there
        let port = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let client = RemoteClient::new("127.0.0.1", port, "t", "p").unwrap();
        let err = client.list("").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }

    fn fast_client(port: u16) -> RemoteClient {
        RemoteClient::new("127.0.0.1", port, "t", "p")
            .unwrap()
            .with_retry_backoff(Duration::from_millis(10))
            .with_read_limit(Duration::from_millis(400))
    }

    #[tokio::test]
    async fn slow_download_that_keeps_moving_completes() {
        // 9 bytes, 150ms apart: well past the limit in total, never idle that long
        let host = FakeHost::start(vec![Reply::Trickle {
            body: b"abcdefghi".to_vec(),
            gap: Duration::from_millis(150),
        }])
        .await;
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("slow.bin");

        let n = fast_client(host.port)
            .download_to("slow.bin", &dest, &TransferProgress::hidden())
            .await
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefghi");
    }

    #[tokio::test]
    async fn stalled_download_times_out_without_retry() {
        let host = FakeHost::start(vec![Reply::Stall]).await;
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("stuck.bin");

        let err = fast_client(host.port)
            .download_to("stuck.bin", &dest, &TransferProgress::hidden())
            .await
            .unwrap_err();
        assert!(matches!(err, CtError::Timeout(_)), "unexpected error: {err:?}");
        assert_eq!(host.hits(), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn dropped_connection_is_retried_until_success() {
        let host = FakeHost::start(vec![
            Reply::Hangup,
            Reply::Trickle {
                body: b"payload".to_vec(),
                gap: Duration::ZERO,
            },
        ])
        .await;
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("p.bin");

        let n = fast_client(host.port)
            .download_to("p.bin", &dest, &TransferProgress::hidden())
            .await
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert_eq!(host.hits(), 2);
    }

    #[tokio::test]
    async fn download_gives_up_after_three_attempts() {
        let host = FakeHost::start(vec![Reply::Hangup]).await;
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("out.bin");

        let err = fast_client(host.port)
            .download_to("out.bin", &dest, &TransferProgress::hidden())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
        assert_eq!(host.hits(), timeouts::DOWNLOAD_ATTEMPTS as usize);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn host_refusals_are_not_retried() {
        for (status, unauthorized) in [(404, false), (401, true)] {
            let host = FakeHost::start(vec![Reply::Status(status)]).await;
            let tmp = tempfile::TempDir::new().unwrap();
            let dest = tmp.path().join("gone.bin");

            let err = fast_client(host.port)
                .download_to("gone.bin", &dest, &TransferProgress::hidden())
                .await
                .unwrap_err();
            if unauthorized {
                assert!(matches!(err, CtError::Unauthorized), "unexpected error: {err:?}");
            } else {
                assert!(matches!(err, CtError::NotFound(_)), "unexpected error: {err:?}");
            }
            assert_eq!(host.hits(), 1);
            assert!(!dest.exists());
        }
    }

    #[tokio::test]
    async fn reachable_tells_listening_ports_apart() {
        let host = FakeHost::start(vec![Reply::Status(404)]).await;
        assert!(fast_client(host.port).reachable().await);

        let closed = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        assert!(!fast_client(closed).reachable().await);
        // a bare connect is not a request
        assert_eq!(host.hits(), 0);
    }
}
