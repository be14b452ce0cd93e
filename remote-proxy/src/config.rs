//! CLI surface for the remote proxy (spec §6). Structured like
//! `local-proxy/src/config.rs`; this side takes `--dns` instead of
//! `-S`/`-P` since it is the tunnel's server end.

use std::path::Path;

use anyhow::{bail, Result};
use clap::Parser;
use tunnel_proto::TlsMaterial;

#[derive(Parser, Debug)]
#[command(name = "socks5-remote", version, about = "Remote tunnel endpoint for the split-tunnel proxy")]
pub struct Cli {
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Tunnel listen address.
    #[arg(short = 'l', long = "host", default_value = "0.0.0.0")]
    pub host: String,

    /// Tunnel listen port.
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    pub port: u16,

    #[arg(long = "ca")]
    pub ca: String,
    #[arg(long = "key")]
    pub key: String,
    #[arg(long = "cert")]
    pub cert: String,

    #[arg(long = "pidfile", default_value = "socks5-remote.pid")]
    pub pidfile: String,
    #[arg(long = "logfile", default_value = "socks5-remote.log")]
    pub logfile: String,
    #[arg(long = "loglevel", default_value = "info")]
    pub loglevel: String,

    /// Upstream DNS resolver, `addr[:port]` (default port 53).
    #[arg(long = "dns", default_value = "8.8.8.8:53")]
    pub dns: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: (String, u16),
    pub tls: TlsMaterial,
    pub dns: std::net::SocketAddr,
    pub daemon: bool,
    pub pidfile: String,
    pub logfile: String,
    pub loglevel: String,
}

fn parse_dns(raw: &str) -> Result<std::net::SocketAddr> {
    if raw.contains(':') {
        raw.parse()
            .map_err(|_| anyhow::anyhow!("invalid --dns value: {raw}"))
    } else {
        format!("{raw}:53")
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --dns value: {raw}"))
    }
}

pub fn load_config() -> Result<Config> {
    let cli = Cli::parse();

    for (name, path) in [("ca", &cli.ca), ("key", &cli.key), ("cert", &cli.cert)] {
        if !Path::new(path).exists() {
            bail!("{name} file not found: {path}");
        }
    }

    Ok(Config {
        listen: (cli.host, cli.port),
        tls: TlsMaterial {
            ca_file: cli.ca,
            cert_file: cli.cert,
            key_file: cli.key,
        },
        dns: parse_dns(&cli.dns)?,
        daemon: cli.daemon,
        pidfile: cli.pidfile,
        logfile: cli.logfile,
        loglevel: cli.loglevel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_defaults_to_port_53() {
        assert_eq!(parse_dns("8.8.8.8").unwrap().port(), 53);
    }

    #[test]
    fn dns_accepts_explicit_port() {
        assert_eq!(parse_dns("8.8.8.8:5353").unwrap().port(), 5353);
    }
}
