use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;

use ctshare::auth::{self, Credentials};
use ctshare::cli::{Cli, Command, HostOpts};
use ctshare::config::{self, HostConfig, HostDefaults, HostSettings};
use ctshare::logger::{Logger, NoopLogger, TextLogger};
use ctshare::server::{self, ServeOptions};
use ctshare::session::SessionStore;
use ctshare::verbs::{ClientOptions, Console, Terminal};

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

async fn interrupted() {
    let _ = tokio::signal::ctrl_c().await;
}

fn host(opts: HostOpts) -> Result<()> {
    let defaults = HostDefaults::load(&config::host_defaults_path())?;
    let settings = HostSettings::merge(
        opts.dir.clone(),
        opts.port,
        opts.write_choice(),
        opts.exec,
        opts.log_file.clone(),
        defaults,
    );

    let password = match opts.password.clone() {
        Some(p) => p,
        None => rpassword::prompt_password("Set access password for this host: ")
            .context("Failed to read password")?,
    };
    if password.trim().is_empty() {
        bail!("An access password is required");
    }

    let token = auth::generate_token();
    let config = HostConfig::new(
        &settings.dir,
        settings.port,
        Credentials::new(token.clone(), password.trim()),
        settings.write,
        settings.exec,
    )?;

    println!("Starting CT host:");
    println!("  Shared:    {}", config.sandbox_root.display());
    println!("  Token:     {}", token);
    println!("  Port:      {}", config.port);
    println!(
        "  Write:     {}",
        if config.write_allowed { "allowed" } else { "read-only" }
    );
    println!(
        "  Run:       {}",
        if config.exec_allowed { "enabled" } else { "disabled" }
    );
    println!("  Discovery: UDP {}", opts.discovery_port);
    if opts.bind.is_unspecified() {
        eprintln!("⚠️  Token and password travel unencrypted; only share on a trusted LAN");
    }
    println!("Press Ctrl+C to stop.");

    let logger: Arc<dyn Logger> = if opts.quiet {
        Arc::new(NoopLogger)
    } else if let Some(path) = &settings.log_file {
        Arc::new(TextLogger::new(path)?)
    } else {
        Arc::new(TextLogger::stderr())
    };

    let serve_opts = ServeOptions {
        bind: opts.bind,
        discovery_port: Some(opts.discovery_port),
    };
    runtime()?.block_on(server::serve(config, serve_opts, logger, interrupted()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = match cli.command {
        Command::Host(opts) => return host(opts),
        other => other,
    };

    let store = SessionStore::new(config::session_path());
    let mut console = Console::new(store, Terminal, std::io::stdout(), ClientOptions::default());
    let outcome = runtime()?.block_on(async {
        match command {
            Command::Join => console.join().await.map(|_| ()),
            Command::CtList => console.hosts().await.map(|_| ()),
            Command::Status => console.status(),
            Command::Exit => console.disconnect(),
            other => match other.verb() {
                Some(verb) => console.apply(verb).await,
                None => Ok(()),
            },
        }
    });

    if let Err(e) = outcome {
        eprintln!("{}", e.diagnose());
        std::process::exit(1);
    }
    Ok(())
}
