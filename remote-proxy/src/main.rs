//! Binary entry-point for the remote tunnel endpoint.

mod config;
mod dispatcher;
mod dns;
mod stream;

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use daemonize::Daemonize;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

fn main() -> Result<()> {
    let cfg = config::load_config()?;

    let log_level = cfg.loglevel.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("listen={}:{} dns={}", cfg.listen.0, cfg.listen.1, cfg.dns);

    if cfg.daemon {
        // `--logfile` is only meaningful with `-d` (spec §6): both stdout
        // and stderr are redirected there, same as
        // `original_source/s54http/utils.py::daemonize(stdout=logfile,
        // stderr=logfile)`.
        let stdout = File::create(&cfg.logfile)
            .with_context(|| format!("opening logfile {}", cfg.logfile))?;
        let stderr = stdout
            .try_clone()
            .with_context(|| format!("cloning logfile handle for {}", cfg.logfile))?;
        Daemonize::new()
            .pid_file(&cfg.pidfile)
            .working_directory(".")
            .stdout(stdout)
            .stderr(stderr)
            .start()
            .context("failed to daemonize")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    let pidfile = cfg.pidfile.clone();
    let daemonized = cfg.daemon;
    let dns_addr = cfg.dns;

    let result = runtime.block_on(async move {
        let resolver = Arc::new(dns::DnsResolver::new(dns_addr));
        tokio::select! {
            res = dispatcher::run(cfg, resolver) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, closing remote proxy");
                Ok(())
            }
        }
    });

    if daemonized {
        let _ = std::fs::remove_file(&pidfile);
    }

    result
}
