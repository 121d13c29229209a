//! Transfer service: the filesystem side of every host operation.
//!
//! Callers must have passed the auth gate already. Every operation resolves
//! its path through the sandbox before touching the filesystem, and error
//! values only ever name the client-supplied relative path.

use crate::config::HostConfig;
use crate::error::{CtError, Result};
use crate::protocol::timeouts;
use crate::sandbox;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(rename = "size")]
    pub size_bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunRequest {
    pub command: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Clone)]
pub struct TransferService {
    config: Arc<HostConfig>,
}

/// Translate filesystem errors without leaking the absolute path.
fn fs_err(e: std::io::Error, rel: &str) -> CtError {
    match e.kind() {
        ErrorKind::NotFound => CtError::NotFound(rel.to_string()),
        ErrorKind::AlreadyExists => CtError::Conflict(rel.to_string()),
        ErrorKind::PermissionDenied => CtError::Forbidden,
        _ => CtError::Io(e),
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Reduce an uploaded file name to a single plain component.
fn upload_name(filename: &str) -> Result<String> {
    let last = filename.rsplit(['/', '\\']).next().unwrap_or("");
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return Err(CtError::BadRequest("invalid file name".into()));
    }
    Ok(last.to_string())
}

impl TransferService {
    pub fn new(config: Arc<HostConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn root(&self) -> &Path {
        &self.config.sandbox_root
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        Ok(sandbox::resolve(self.root(), rel)?)
    }

    fn require_write(&self) -> Result<()> {
        if self.config.write_allowed {
            Ok(())
        } else {
            Err(CtError::Forbidden)
        }
    }

    /// Directory listing: directories first, then files, each alphabetical.
    /// Entries that are links leading out of the sandbox are left out.
    pub async fn list(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(rel)?;
        let meta = tokio::fs::metadata(&dir).await.map_err(|e| fs_err(e, rel))?;
        if !meta.is_dir() {
            return Err(CtError::NotFound(rel.to_string()));
        }

        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await.map_err(|e| fs_err(e, rel))?;
        while let Some(e) = rd.next_entry().await.map_err(|e| fs_err(e, rel))? {
            let name = e.file_name().to_string_lossy().into_owned();
            let ft = match e.file_type().await {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            let target = if ft.is_symlink() {
                match sandbox::resolve(self.root(), &join_rel(rel, &name)) {
                    Ok(p) => p,
                    Err(_) => continue,
                }
            } else {
                e.path()
            };
            let Ok(m) = tokio::fs::metadata(&target).await else {
                continue;
            };
            entries.push(DirEntry {
                name,
                is_dir: m.is_dir(),
                size_bytes: if m.is_file() { m.len() } else { 0 },
            });
        }

        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Open a regular file for streaming; returns the handle and its length.
    pub async fn open_download(&self, rel: &str) -> Result<(tokio::fs::File, u64)> {
        let path = self.resolve(rel)?;
        let meta = tokio::fs::metadata(&path).await.map_err(|e| fs_err(e, rel))?;
        if !meta.is_file() {
            return Err(CtError::NotFound(rel.to_string()));
        }
        let file = tokio::fs::File::open(&path).await.map_err(|e| fs_err(e, rel))?;
        Ok((file, meta.len()))
    }

    /// Write `bytes` as `filename` inside the directory `rel_dir`. An existing
    /// file is replaced; concurrent writers race, last one wins.
    pub async fn upload(&self, rel_dir: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        self.require_write()?;
        let name = upload_name(filename)?;
        let dir = self.resolve(rel_dir)?;
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {}
            _ => return Err(CtError::NotFound(rel_dir.to_string())),
        }

        let rel = join_rel(rel_dir, &name);
        let target = self.resolve(&rel)?;
        if let Ok(m) = tokio::fs::metadata(&target).await {
            if m.is_dir() {
                return Err(CtError::Conflict(rel));
            }
        }
        // Stage next to the target and rename, so readers never see a partial file
        let staged = dir.join(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&staged, bytes).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(fs_err(e, &rel));
        }
        if let Err(e) = tokio::fs::rename(&staged, &target).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(fs_err(e, &rel));
        }
        Ok(rel)
    }

    /// Create a directory (and missing parents). An existing entry is a conflict
    /// and is left untouched.
    pub async fn mkdir(&self, rel: &str) -> Result<()> {
        self.require_write()?;
        let path = self.resolve(rel)?;
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            return Err(CtError::Conflict(rel.to_string()));
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| fs_err(e, rel))
    }

    /// Remove a file, a link, or a whole directory tree. The root itself
    /// cannot be removed.
    pub async fn delete(&self, rel: &str) -> Result<()> {
        self.require_write()?;
        let path = sandbox::resolve_entry(self.root(), rel)?;
        if path == self.root() {
            return Err(CtError::Forbidden);
        }
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| fs_err(e, rel))?;
        let ft = meta.file_type();
        let res = if ft.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            match tokio::fs::remove_file(&path).await {
                // directory links on Windows need remove_dir
                Err(_) if ft.is_symlink() => tokio::fs::remove_dir(&path).await,
                other => other,
            }
        };
        res.map_err(|e| fs_err(e, rel))
    }

    /// Run `command` in the host shell with the sandbox root as working
    /// directory. The child is killed when the time limit passes.
    pub async fn run(&self, command: &str) -> Result<RunOutput> {
        if command.trim().is_empty() {
            return Err(CtError::BadRequest("empty command".into()));
        }
        let mut cmd = shell_command(command);
        cmd.current_dir(self.root())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn()?;

        match tokio::time::timeout(timeouts::RUN_COMMAND, child.wait_with_output()).await {
            Ok(out) => {
                let out = out?;
                Ok(RunOutput {
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                    returncode: out.status.code(),
                    timed_out: false,
                })
            }
            Err(_) => Ok(RunOutput {
                stderr: format!(
                    "command exceeded {}s and was killed",
                    timeouts::RUN_COMMAND.as_secs()
                ),
                timed_out: true,
                ..RunOutput::default()
            }),
        }
    }
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use std::fs;
    use tempfile::TempDir;

    fn service(root: &Path, write: bool) -> TransferService {
        let cfg = HostConfig::new(root, 8000, Credentials::new("t", "p"), write, false).unwrap();
        TransferService::new(Arc::new(cfg))
    }

    #[tokio::test]
    async fn list_orders_dirs_first_and_reports_sizes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), b"hello world!").unwrap();
        fs::write(tmp.path().join("a.bin"), b"x").unwrap();
        fs::create_dir(tmp.path().join("zeta")).unwrap();

        let entries = service(tmp.path(), false).list("").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["zeta", "a.bin", "notes.txt"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size_bytes, 0);
        assert_eq!(entries[2].size_bytes, 12);
    }

    #[tokio::test]
    async fn list_of_file_or_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f.txt"), b"x").unwrap();
        let svc = service(tmp.path(), false);
        assert!(matches!(svc.list("f.txt").await, Err(CtError::NotFound(_))));
        assert!(matches!(svc.list("missing").await, Err(CtError::NotFound(_))));
    }

    #[tokio::test]
    async fn escape_attempts_are_rejected_before_io() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path(), true);
        assert!(matches!(svc.list("../..").await, Err(CtError::PathEscape)));
        assert!(matches!(svc.open_download("../../etc/passwd").await, Err(CtError::PathEscape)));
        assert!(matches!(svc.upload("..", "x.txt", b"x").await, Err(CtError::PathEscape)));
        assert!(matches!(svc.mkdir("../evil").await, Err(CtError::PathEscape)));
        assert!(matches!(svc.delete("../x").await, Err(CtError::PathEscape)));
    }

    #[tokio::test]
    async fn download_of_directory_is_not_found() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        let svc = service(tmp.path(), false);
        assert!(matches!(svc.open_download("d").await, Err(CtError::NotFound(_))));
        assert!(matches!(svc.open_download("nope.txt").await, Err(CtError::NotFound(_))));
    }

    #[tokio::test]
    async fn upload_reduces_filename_to_last_component() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let svc = service(tmp.path(), true);

        let rel = svc.upload("sub", "../../evil.txt", b"data").await.unwrap();
        assert_eq!(rel, "sub/evil.txt");
        assert_eq!(fs::read(tmp.path().join("sub/evil.txt")).unwrap(), b"data");
        assert!(matches!(svc.upload("", "..", b"x").await, Err(CtError::BadRequest(_))));
        assert!(matches!(svc.upload("", "", b"x").await, Err(CtError::BadRequest(_))));
        assert!(matches!(svc.upload("missing", "a.txt", b"x").await, Err(CtError::NotFound(_))));
    }

    #[tokio::test]
    async fn upload_overwrites_existing_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), b"old").unwrap();
        let svc = service(tmp.path(), true);
        svc.upload("", "a.txt", b"new contents").await.unwrap();
        assert_eq!(fs::read(tmp.path().join("a.txt")).unwrap(), b"new contents");
        // no staging files left behind
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn writes_are_forbidden_on_readonly_host() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("keep.txt"), b"k").unwrap();
        let svc = service(tmp.path(), false);

        assert!(matches!(svc.upload("", "a.txt", b"x").await, Err(CtError::Forbidden)));
        assert!(matches!(svc.mkdir("d").await, Err(CtError::Forbidden)));
        assert!(matches!(svc.delete("keep.txt").await, Err(CtError::Forbidden)));
        assert!(tmp.path().join("keep.txt").exists());
        assert!(!tmp.path().join("d").exists());
        // reads still work
        assert_eq!(svc.list("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mkdir_conflict_leaves_contents_alone() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path(), true);
        svc.mkdir("docs/inner").await.unwrap();
        fs::write(tmp.path().join("docs/inner/a.txt"), b"a").unwrap();

        for _ in 0..2 {
            assert!(matches!(svc.mkdir("docs/inner").await, Err(CtError::Conflict(_))));
        }
        assert_eq!(fs::read(tmp.path().join("docs/inner/a.txt")).unwrap(), b"a");
        assert!(matches!(svc.mkdir("").await, Err(CtError::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_cascades_and_protects_root() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("tree/deep")).unwrap();
        fs::write(tmp.path().join("tree/deep/f.txt"), b"f").unwrap();
        fs::write(tmp.path().join("single.txt"), b"s").unwrap();
        let svc = service(tmp.path(), true);

        svc.delete("tree").await.unwrap();
        svc.delete("single.txt").await.unwrap();
        assert!(!tmp.path().join("tree").exists());
        assert!(!tmp.path().join("single.txt").exists());
        assert!(matches!(svc.delete("single.txt").await, Err(CtError::NotFound(_))));
        assert!(matches!(svc.delete("").await, Err(CtError::Forbidden)));
        assert!(matches!(svc.delete("/").await, Err(CtError::Forbidden)));
        assert!(tmp.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_of_link_removes_only_the_link() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("precious.txt"), b"p").unwrap();
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let svc = service(tmp.path(), true);

        svc.delete("link").await.unwrap();
        assert!(fs::symlink_metadata(tmp.path().join("link")).is_err());
        assert!(outside.path().join("precious.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_hides_links_leaving_the_sandbox() {
        let outside = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("inside.txt"), b"i").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("inside.txt"), tmp.path().join("alias.txt"))
            .unwrap();

        let entries = service(tmp.path(), false).list("").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alias.txt", "inside.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_output_in_sandbox_root() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("marker.txt"), b"m").unwrap();
        let svc = service(tmp.path(), false);

        let out = svc.run("ls; echo oops >&2; exit 3").await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.returncode, Some(3));
        assert!(!out.timed_out);
        assert!(matches!(svc.run("   ").await, Err(CtError::BadRequest(_))));
    }
}
