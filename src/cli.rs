//! Clap command tree for `ct` and `ct-runner`

use crate::protocol::{DISCOVERY_PORT, EXEC_PORT};
use crate::verbs::Verb;
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "ct",
    author,
    version,
    about = "CT - share one directory over the LAN and work with it from any machine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Share a directory on this machine
    Host(HostOpts),
    /// Find a host on the LAN and connect to it
    Join,
    /// Enumerate hosts visible via discovery
    #[command(name = "ctlist")]
    CtList,
    /// List the remote working directory
    Ls,
    /// Change the remote working directory
    Cd { dir: String },
    /// Go up one remote directory
    Back,
    /// Print the remote working directory
    Pwd,
    /// Download a remote file into the local working directory
    C { file: String },
    /// Upload a local file into the remote working directory
    U { file: PathBuf },
    /// Copy a remote file into the CT clipboard
    Cp { file: String },
    /// Paste the CT clipboard into the remote working directory
    Paste {
        /// Paste into the local working directory instead
        #[arg(short = 'o', long)]
        local: bool,
    },
    /// Create a remote directory
    Mkdir { name: String },
    /// Delete a remote file or directory tree
    Rm {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Run a shell command on the host
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show the current session
    Status,
    /// Disconnect and forget the session
    Exit,
}

impl Command {
    /// Verbs that operate on a loaded session.
    pub fn verb(&self) -> Option<Verb> {
        Some(match self {
            Command::Ls => Verb::Ls,
            Command::Cd { dir } => Verb::Cd(dir.clone()),
            Command::Back => Verb::Back,
            Command::Pwd => Verb::Pwd,
            Command::C { file } => Verb::Fetch(file.clone()),
            Command::U { file } => Verb::Put(file.clone()),
            Command::Cp { file } => Verb::Cp(file.clone()),
            Command::Paste { local } => Verb::Paste { local: *local },
            Command::Mkdir { name } => Verb::Mkdir(name.clone()),
            Command::Rm { name, force } => Verb::Rm {
                name: name.clone(),
                force: *force,
            },
            Command::Run { command } => Verb::Run(command.join(" ")),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct HostOpts {
    /// Directory to share (default: home directory)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// TCP port for the transfer listener (default: 8000)
    #[arg(long)]
    pub port: Option<u16>,

    /// Refuse uploads, mkdir and delete (default)
    #[arg(long, conflicts_with = "write")]
    pub readonly: bool,

    /// Allow uploads, mkdir and delete
    #[arg(long)]
    pub write: bool,

    /// Serve the /run endpoint (remote shell commands in the shared directory)
    #[arg(long)]
    pub exec: bool,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// UDP port for the discovery responder
    #[arg(long, default_value_t = DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Append host events to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Do not log host events
    #[arg(short, long)]
    pub quiet: bool,

    /// Access password (prompted when not given)
    #[arg(long, env = "CT_HOST_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl HostOpts {
    /// Explicit write choice from the flags; `None` defers to host.toml.
    pub fn write_choice(&self) -> Option<bool> {
        match (self.write, self.readonly) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// Host-side watcher that starts the execution listener on request
#[derive(Debug, Parser)]
#[command(name = "ct-runner", author, version)]
pub struct RunnerOpts {
    /// Shared directory to watch for activation requests
    #[arg(long)]
    pub dir: PathBuf,

    /// Address the execution listener binds
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Only accept activations for this port
    #[arg(long, default_value_t = EXEC_PORT)]
    pub port: u16,

    /// Append events to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(short, long)]
    pub quiet: bool,
}
