//! Client verbs.
//!
//! `join`, `ctlist`, `status` and `exit` work without a session. Every other
//! verb receives the loaded [`ClientSession`] explicitly; [`Console::apply`]
//! loads it once, runs the verb and writes it back only if the verb changed it.

use crate::bootstrap::{self, Activation, RunVia};
use crate::client::{self, RemoteClient};
use crate::discovery::{self, DiscoveryAnnouncement};
use crate::error::{CtError, Result};
use crate::progress::TransferProgress;
use crate::protocol::{timeouts, DEFAULT_PORT, DISCOVERY_PORT, EXEC_PORT};
use crate::service::{DirEntry, RunOutput};
use crate::session::{join_logical, ClientSession, SessionStore};
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Source of interactive answers; scripted in tests.
pub trait Prompter {
    fn ask(&mut self, prompt: &str) -> io::Result<String>;
    fn ask_secret(&mut self, prompt: &str) -> io::Result<String>;
}

/// Reads answers from the controlling terminal.
pub struct Terminal;

impl Prompter for Terminal {
    fn ask(&mut self, prompt: &str) -> io::Result<String> {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }

    fn ask_secret(&mut self, prompt: &str) -> io::Result<String> {
        rpassword::prompt_password(prompt).map(|s| s.trim().to_string())
    }
}

/// Session-changing and session-reading verbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Ls,
    Cd(String),
    Back,
    Pwd,
    /// `c`: download into the local working directory
    Fetch(String),
    /// `u`: upload a local file into the remote working directory
    Put(PathBuf),
    Cp(String),
    Paste { local: bool },
    Mkdir(String),
    Rm { name: String, force: bool },
    Run(String),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub discovery_target: SocketAddr,
    /// Local working directory for `c`, `u` and `paste --local`
    pub cwd: PathBuf,
    pub clipboard_dir: PathBuf,
    pub activation: Activation,
    pub retry_backoff: Duration,
    pub show_progress: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "user".into());
        Self {
            discovery_target: discovery::broadcast_target(DISCOVERY_PORT),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            clipboard_dir: std::env::temp_dir().join(format!("ct_clipboard_{user}")),
            activation: Activation {
                exec_port: EXEC_PORT,
                polls: timeouts::ACTIVATION_POLLS,
                interval: timeouts::ACTIVATION_POLL_INTERVAL,
            },
            retry_backoff: timeouts::RETRY_BACKOFF,
            show_progress: true,
        }
    }
}

pub struct Console<P, W> {
    store: SessionStore,
    prompter: P,
    out: W,
    opts: ClientOptions,
}

fn format_entry(i: usize, e: &DirEntry) -> String {
    if e.is_dir {
        format!("[{i}] {:<40} <DIR>", e.name)
    } else {
        format!("[{i}] {:<40} {} bytes", e.name, e.size_bytes)
    }
}

fn mask(secret: &str) -> String {
    "•".repeat(secret.chars().count())
}

fn base_name(path: &str) -> Result<String> {
    path.rsplit(['/', '\\'])
        .find(|p| !p.is_empty() && *p != "." && *p != "..")
        .map(str::to_string)
        .ok_or_else(|| CtError::BadRequest(format!("not a file name: {path}")))
}

impl<P: Prompter, W: Write> Console<P, W> {
    pub fn new(store: SessionStore, prompter: P, out: W, opts: ClientOptions) -> Self {
        Self {
            store,
            prompter,
            out,
            opts,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn client(&self, session: &ClientSession) -> Result<RemoteClient> {
        Ok(session.client()?.with_retry_backoff(self.opts.retry_backoff))
    }

    fn progress(&self, label: &str, bytes: bool) -> TransferProgress {
        match (self.opts.show_progress, bytes) {
            (false, _) => TransferProgress::hidden(),
            (true, true) => TransferProgress::bytes(label),
            (true, false) => TransferProgress::spinner(label),
        }
    }

    /// Discover hosts, let the user pick one (or enter it manually), verify the
    /// credentials with one listing and persist the new session.
    pub async fn join(&mut self) -> Result<ClientSession> {
        writeln!(self.out, "🔍 Searching for CT hosts on the LAN...")?;
        let window = Duration::from_millis(timeouts::JOIN_DISCOVERY_MS);
        let hosts = discovery::discover(self.opts.discovery_target, window)
            .await
            .unwrap_or_default();

        let picked = if hosts.is_empty() {
            writeln!(self.out, "No hosts found.")?;
            None
        } else {
            writeln!(self.out, "\n🌐 Found CT hosts:")?;
            for (i, h) in hosts.iter().enumerate() {
                writeln!(self.out, "  [{i}] {}", describe(h))?;
            }
            writeln!(self.out, "  [m] manual entry (ip:port)\n")?;
            let sel = self.prompter.ask("Select host # or 'm': ")?.to_lowercase();
            if sel == "m" {
                None
            } else {
                let host = sel
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| hosts.get(i))
                    .ok_or_else(|| CtError::BadRequest(format!("invalid selection: {sel}")))?;
                Some(host.clone())
            }
        };

        let (ip, port, announced_token, write_allowed) = match picked {
            Some(h) => (h.ip, h.port, Some(h.token), h.write_allowed),
            None => {
                let entry = self.prompter.ask("Enter host as ip[:port]: ")?;
                let (ip, port) = parse_host(&entry)?;
                (ip, port, None, true)
            }
        };

        let mut token = self.prompter.ask("Enter token / key: ")?;
        if token.is_empty() {
            token = announced_token.unwrap_or_default();
        }
        let password = self.prompter.ask_secret("Enter password: ")?;

        let session = ClientSession::new(&ip, port, &token, &password, write_allowed);
        self.client(&session)?.list("").await?;

        if let Some(previous) = self.store.load().ok().flatten() {
            if previous.address() != session.address() {
                writeln!(self.out, "Leaving previous session with {}", previous.address())?;
            }
        }
        self.store.save(&session)?;
        writeln!(
            self.out,
            "\n✅ Connected to {}. Session saved to {}",
            session.address(),
            self.store.path().display()
        )?;
        Ok(session)
    }

    /// `ctlist`: show every host answering discovery.
    pub async fn hosts(&mut self) -> Result<Vec<DiscoveryAnnouncement>> {
        let window = Duration::from_millis(timeouts::LIST_DISCOVERY_MS);
        let hosts = discovery::discover(self.opts.discovery_target, window)
            .await
            .map_err(|e| CtError::Connection(e.to_string()))?;
        if hosts.is_empty() {
            writeln!(self.out, "No CT hosts found on the LAN.")?;
        } else {
            writeln!(self.out, "🌐 CT hosts:")?;
            for (i, h) in hosts.iter().enumerate() {
                writeln!(self.out, "  [{i}] {}  token={}", describe(h), h.token)?;
            }
        }
        Ok(hosts)
    }

    pub fn status(&mut self) -> Result<()> {
        let Some(s) = self.store.load()? else {
            writeln!(self.out, "⚠️  Not connected to any CT host.")?;
            writeln!(self.out, "Use `ct join` to connect to a host.")?;
            return Ok(());
        };
        writeln!(self.out, "🔗 Connected to CT host")?;
        writeln!(self.out, "  Host:      {}", s.address())?;
        writeln!(self.out, "  Token:     {}", s.token)?;
        writeln!(self.out, "  Password:  {}", mask(&s.password))?;
        writeln!(self.out, "  Path:      {}", s.display_path())?;
        writeln!(
            self.out,
            "  Mode:      {}",
            if s.write_allowed { "read-write" } else { "read-only" }
        )?;
        let clip = s
            .clipboard
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(empty)".into());
        writeln!(self.out, "  Clipboard: {clip}")?;
        writeln!(self.out, "  Session:   {}", self.store.path().display())?;
        if let Ok(modified) = std::fs::metadata(self.store.path()).and_then(|m| m.modified()) {
            let when: chrono::DateTime<chrono::Local> = modified.into();
            writeln!(self.out, "  Updated:   {}", when.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }

    /// `exit`: forget the session.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.store.clear()? {
            Some(s) => writeln!(self.out, "🔌 Disconnected from CT host {}", s.address())?,
            None => writeln!(self.out, "No active CT session to exit.")?,
        }
        Ok(())
    }

    /// Load the session, run `verb` against it, and persist any change.
    pub async fn apply(&mut self, verb: Verb) -> Result<()> {
        let mut session = self.store.require()?;
        let before = session.clone();
        match verb {
            Verb::Ls => self.ls(&session).await?,
            Verb::Cd(target) => self.cd(&mut session, &target).await?,
            Verb::Back => self.cd(&mut session, "..").await?,
            Verb::Pwd => self.pwd(&session)?,
            Verb::Fetch(name) => {
                self.fetch(&session, &name).await?;
            }
            Verb::Put(path) => self.put(&session, &path).await?,
            Verb::Cp(name) => self.cp(&mut session, &name).await?,
            Verb::Paste { local } => self.paste(&session, local).await?,
            Verb::Mkdir(name) => self.mkdir(&session, &name).await?,
            Verb::Rm { name, force } => self.rm(&session, &name, force).await?,
            Verb::Run(command) => self.run(&session, &command).await?,
        }
        if session != before {
            self.store.save(&session)?;
        }
        Ok(())
    }

    pub async fn ls(&mut self, session: &ClientSession) -> Result<()> {
        let entries = self.client(session)?.list(&session.cur_path).await?;
        writeln!(self.out, "📂 {}:{}", session.address(), session.display_path())?;
        if entries.is_empty() {
            writeln!(self.out, "(empty)")?;
        }
        for (i, e) in entries.iter().enumerate() {
            writeln!(self.out, "{}", format_entry(i, e))?;
        }
        Ok(())
    }

    /// Move the remote working directory. The target must list successfully
    /// before the session changes.
    pub async fn cd(&mut self, session: &mut ClientSession, target: &str) -> Result<()> {
        let next = join_logical(&session.cur_path, target);
        if next == session.cur_path && session.cur_path.is_empty() && target.trim() == ".." {
            writeln!(self.out, "📁 Already at remote root directory.")?;
            return Ok(());
        }
        self.client(session)?.list(&next).await?;
        session.cur_path = next;
        writeln!(self.out, "📁 {}", session.display_path())?;
        Ok(())
    }

    pub fn pwd(&mut self, session: &ClientSession) -> Result<()> {
        writeln!(self.out, "{}", session.display_path())?;
        Ok(())
    }

    /// `c`: download into the local working directory.
    pub async fn fetch(&mut self, session: &ClientSession, name: &str) -> Result<PathBuf> {
        let dest = self.opts.cwd.join(base_name(name)?);
        let remote = session.remote_path(name);
        let progress = self.progress(&format!("Downloading {}", client::display(&remote)), true);
        let n = self.client(session)?.download_to(&remote, &dest, &progress).await;
        progress.finish();
        let n = n?;
        writeln!(
            self.out,
            "✅ Downloaded {} ({n} bytes) to {}",
            client::display(&remote),
            dest.display()
        )?;
        Ok(dest)
    }

    /// `u`: upload a local file into the remote working directory.
    pub async fn put(&mut self, session: &ClientSession, local: &Path) -> Result<()> {
        if !session.write_allowed {
            return Err(CtError::Forbidden);
        }
        let path = self.opts.cwd.join(local);
        self.upload_file(session, &path).await
    }

    async fn upload_file(&mut self, session: &ClientSession, path: &Path) -> Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CtError::LocalNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CtError::LocalNotFound(path.to_path_buf()))?;
        let len = bytes.len();
        let progress = self.progress(&format!("Uploading {name}"), false);
        let res = self.client(session)?.upload(&session.cur_path, &name, bytes).await;
        progress.finish();
        res?;
        writeln!(
            self.out,
            "✅ Uploaded {name} ({len} bytes) to {}",
            client::display(&session.remote_path(&name))
        )?;
        Ok(())
    }

    /// `cp`: download into the clipboard slot.
    pub async fn cp(&mut self, session: &mut ClientSession, name: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.opts.clipboard_dir).await?;
        let dest = self.opts.clipboard_dir.join(base_name(name)?);
        let remote = session.remote_path(name);
        let progress = self.progress(&format!("Copying {}", client::display(&remote)), true);
        let res = self.client(session)?.download_to(&remote, &dest, &progress).await;
        progress.finish();
        res?;
        session.clipboard = Some(dest);
        writeln!(self.out, "📋 Copied {} to CT clipboard", client::display(&remote))?;
        Ok(())
    }

    /// `paste`: upload the clipboard file into the remote working directory,
    /// or with `local` copy it into the local working directory.
    pub async fn paste(&mut self, session: &ClientSession, local: bool) -> Result<()> {
        let clip = match &session.clipboard {
            Some(p) if p.is_file() => p.clone(),
            _ => return Err(CtError::EmptyClipboard),
        };
        if local {
            let name = clip.file_name().ok_or(CtError::EmptyClipboard)?;
            let dest = self.opts.cwd.join(name);
            tokio::fs::copy(&clip, &dest).await?;
            writeln!(self.out, "📋 Pasted to {}", dest.display())?;
            return Ok(());
        }
        self.upload_file(session, &clip).await
    }

    pub async fn mkdir(&mut self, session: &ClientSession, name: &str) -> Result<()> {
        let remote = session.remote_path(name);
        self.client(session)?.mkdir(&remote).await?;
        writeln!(self.out, "✅ Folder created: {}", client::display(&remote))?;
        Ok(())
    }

    /// Delete a remote file or directory tree. Asks first unless `force`.
    pub async fn rm(&mut self, session: &ClientSession, name: &str, force: bool) -> Result<()> {
        let remote = session.remote_path(name);
        if !force {
            let answer = self
                .prompter
                .ask(&format!("Delete remote '{}'? (y/n): ", client::display(&remote)))?;
            if !matches!(answer.to_lowercase().as_str(), "y" | "yes") {
                return Err(CtError::Cancelled);
            }
        }
        self.client(session)?.delete(&remote).await?;
        writeln!(self.out, "🗑️  Deleted {}", client::display(&remote))?;
        Ok(())
    }

    pub async fn run(&mut self, session: &ClientSession, command: &str) -> Result<()> {
        let client = self.client(session)?;
        let (out, via) = match bootstrap::run_remote(&client, command, self.opts.activation).await {
            Err(CtError::Forbidden) => {
                writeln!(
                    self.out,
                    "⛔ Host does not serve /run and refused the activation upload (read-only host)."
                )?;
                return Err(CtError::Forbidden);
            }
            other => other?,
        };
        if let RunVia::ExecListener(port) = via {
            writeln!(self.out, "⚙️  Ran through execution listener on port {port}")?;
        }
        self.print_run(&out)
    }

    fn print_run(&mut self, out: &RunOutput) -> Result<()> {
        if out.stdout.trim().is_empty() {
            writeln!(self.out, "(no output)")?;
        } else {
            writeln!(self.out, "{}", out.stdout.trim_end())?;
        }
        if !out.stderr.trim().is_empty() {
            writeln!(self.out, "--- stderr ---")?;
            writeln!(self.out, "{}", out.stderr.trim_end())?;
        }
        if out.timed_out {
            writeln!(self.out, "⏱️  Command timed out on the host")?;
        }
        match out.returncode {
            Some(code) => writeln!(self.out, "[exit status {code}]")?,
            None => writeln!(self.out, "[no exit status]")?,
        }
        Ok(())
    }
}

fn describe(h: &DiscoveryAnnouncement) -> String {
    let mode = if h.write_allowed { "write" } else { "read-only" };
    match &h.name {
        Some(name) => format!("{} ({name}, {mode})", h.key()),
        None => format!("{} ({mode})", h.key()),
    }
}

/// `ip[:port]`; the port defaults to the standard host port.
fn parse_host(entry: &str) -> Result<(String, u16)> {
    let entry = entry.trim();
    let (ip, port) = match entry.rsplit_once(':') {
        Some((ip, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| CtError::BadRequest(format!("invalid port in {entry}")))?;
            (ip, port)
        }
        None => (entry, DEFAULT_PORT),
    };
    if ip.is_empty() {
        return Err(CtError::BadRequest("invalid host format".into()));
    }
    Ok((ip.to_string(), port))
}
