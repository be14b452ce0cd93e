//! CLI surface for the local proxy (spec §6). Grounded on the teacher's
//! `mtls-proxy/src/config.rs`; unlike the teacher there is no YAML file —
//! flags are the only source, matching the original's `parse_args`
//! overlay-onto-defaults behavior (`original_source/s54http/utils.py`).

use std::path::Path;

use anyhow::{bail, Result};
use clap::Parser;
use tunnel_proto::TlsMaterial;

#[derive(Parser, Debug)]
#[command(name = "socks5-local", version, about = "Local SOCKS5 front-end for the split-tunnel proxy")]
pub struct Cli {
    /// Detach from the terminal.
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// SOCKS5 listen address.
    #[arg(short = 'l', long = "host", default_value = "127.0.0.1")]
    pub host: String,

    /// SOCKS5 listen port.
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    pub port: u16,

    /// Remote tunnel peer address.
    #[arg(short = 'S', long = "remote-host")]
    pub remote_host: String,

    /// Remote tunnel peer port.
    #[arg(short = 'P', long = "remote-port", default_value_t = 8080)]
    pub remote_port: u16,

    #[arg(long = "ca")]
    pub ca: String,
    #[arg(long = "key")]
    pub key: String,
    #[arg(long = "cert")]
    pub cert: String,

    #[arg(long = "pidfile", default_value = "socks5-local.pid")]
    pub pidfile: String,
    #[arg(long = "logfile", default_value = "socks5-local.log")]
    pub logfile: String,
    #[arg(long = "loglevel", default_value = "info")]
    pub loglevel: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: (String, u16),
    pub remote: (String, u16),
    pub tls: TlsMaterial,
    pub daemon: bool,
    pub pidfile: String,
    pub logfile: String,
    pub loglevel: String,
}

/// Parse CLI flags and validate that all TLS material exists on disk,
/// exactly as `original_source/s54http/utils.py::parse_args` does before
/// the process is allowed to open any socket.
pub fn load_config() -> Result<Config> {
    let cli = Cli::parse();

    for (name, path) in [("ca", &cli.ca), ("key", &cli.key), ("cert", &cli.cert)] {
        if !Path::new(path).exists() {
            bail!("{name} file not found: {path}");
        }
    }

    Ok(Config {
        listen: (cli.host, cli.port),
        remote: (cli.remote_host, cli.remote_port),
        tls: TlsMaterial {
            ca_file: cli.ca,
            cert_file: cli.cert,
            key_file: cli.key,
        },
        daemon: cli.daemon,
        pidfile: cli.pidfile,
        logfile: cli.logfile,
        loglevel: cli.loglevel,
    })
}
