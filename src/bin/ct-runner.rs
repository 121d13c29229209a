use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

use ctshare::bootstrap;
use ctshare::cli::RunnerOpts;
use ctshare::logger::{Logger, NoopLogger, TextLogger};
use ctshare::protocol::{timeouts, RUNNER_MANIFEST};
use ctshare::server;

fn main() -> Result<()> {
    let opts = RunnerOpts::parse();

    if !opts.dir.is_dir() {
        bail!("Watched directory does not exist: {}", opts.dir.display());
    }

    println!("CT runner watching {}", opts.dir.display());
    println!("  Activation file: {}", RUNNER_MANIFEST);
    println!("  Listener port:   {}", opts.port);

    let logger: Arc<dyn Logger> = if opts.quiet {
        Arc::new(NoopLogger)
    } else if let Some(path) = &opts.log_file {
        Arc::new(TextLogger::new(path)?)
    } else {
        Arc::new(TextLogger::stderr())
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let manifest = loop {
            tokio::select! {
                m = bootstrap::wait_for_manifest(
                    &opts.dir,
                    timeouts::WATCH_INTERVAL,
                    logger.as_ref(),
                ) => {
                    if m.port == opts.port {
                        break m;
                    }
                    let msg = format!("activation for unexpected port {}", m.port);
                    logger.error("runner", RUNNER_MANIFEST, &msg);
                }
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        };

        let config = manifest.host_config(&opts.dir)?;
        let addr = SocketAddr::new(opts.bind, manifest.port);
        println!("Activation received; serving /run on {}", addr);
        server::serve_exec(config, addr, logger.clone(), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    })
}
