use core::{fmt, time::Duration};
use std::{
    net::{IpAddr, Ipv6Addr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{anyhow, bail, Error};
use url::Url;

use crate::{cmd::Cmd, net};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// A local address to bind outgoing sockets on. An IPv6 address may carry an
/// interface scope (`fe80::1%eth0`), resolved at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddr {
    pub ip: IpAddr,
    pub iface: Option<String>,
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.iface {
            Some(iface) => write!(fmt, "{}%{}", self.ip, iface),
            None => write!(fmt, "{}", self.ip),
        }
    }
}

impl LocalAddr {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let m = match s.split_once('%') {
            Some((addr, iface)) => {
                let ip = addr
                    .parse::<Ipv6Addr>()
                    .map_err(|_| anyhow!("invalid local IPv6 address: {s:?}"))?;
                Self {
                    ip: IpAddr::V6(ip),
                    iface: Some(iface.to_owned()),
                }
            }
            None => Self {
                ip: s
                    .parse()
                    .map_err(|_| anyhow!("invalid local IP address: {s:?}"))?,
                iface: None,
            },
        };

        Ok(m)
    }
}

/// Immutable run configuration, fixed after argument parsing.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus query, as it appears on the request line.
    pub path: String,
    pub connections: u64,
    pub threads: u64,
    pub duration: Duration,
    pub timeout: Duration,
    pub rate: u64,
    pub latency: bool,
    pub u_latency: bool,
    pub record_all_responses: bool,
    pub warmup: bool,
    pub warmup_timeout: Option<Duration>,
    pub local_ips: Vec<LocalAddr>,
    pub headers: Vec<String>,
    pub script: Option<PathBuf>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl TryFrom<Cmd> for Config {
    type Error = Error;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        let url = Url::parse(&cmd.url).map_err(|e| anyhow!("invalid URL: {}: {e}", cmd.url))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => bail!("unsupported URL scheme: {other:?}"),
        };
        // IPv6 literals come back bracketed; resolution and SNI take the
        // bare address.
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("invalid URL: {}: missing host", cmd.url))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = url.port().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };

        if cmd.threads == 0 {
            bail!("number of threads must be positive");
        }
        if cmd.connections == 0 || cmd.connections < cmd.threads {
            bail!("number of connections must be >= threads");
        }
        if cmd.rate == 0 {
            bail!("throughput must be specified with the --rate or -R option");
        }
        if cmd.duration == 0 {
            bail!("duration must be positive");
        }

        let local_ips = match &cmd.local_ip {
            Some(list) => list
                .split(',')
                .filter(|s| !s.is_empty())
                .map(LocalAddr::parse)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let tls = match scheme {
            Scheme::Https => {
                let config = net::tls_config()
                    .map_err(|e| anyhow!("unable to initialize TLS: {e}"))?;
                Some(Arc::new(config))
            }
            Scheme::Http => None,
        };

        let m = Self {
            url: cmd.url,
            scheme,
            host,
            port,
            path,
            connections: cmd.connections,
            threads: cmd.threads,
            duration: Duration::from_secs(cmd.duration),
            timeout: Duration::from_secs(cmd.timeout),
            rate: cmd.rate,
            latency: cmd.latency || cmd.u_latency,
            u_latency: cmd.u_latency,
            record_all_responses: !cmd.batch_latency,
            warmup: cmd.warmup,
            warmup_timeout: None,
            local_ips,
            headers: cmd.headers,
            script: cmd.script,
            tls,
        };

        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn config(args: &[&str]) -> Result<Config, Error> {
        Cmd::parse_from(args).try_into()
    }

    #[test]
    fn decomposes_url() {
        let cfg = config(&["pummel", "-R1000", "http://example.com:8080/p?q=1"]).unwrap();

        assert_eq!(cfg.scheme, Scheme::Http);
        assert_eq!(cfg.host, "example.com");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path, "/p?q=1");
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn default_ports_follow_scheme() {
        let cfg = config(&["pummel", "-R1", "http://example.com/"]).unwrap();
        assert_eq!(cfg.port, 80);

        let cfg = config(&["pummel", "-R1", "https://example.com/"]).unwrap();
        assert_eq!(cfg.port, 443);
        assert!(cfg.tls.is_some());
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(config(&["pummel", "-R1000", "ftp://example.com/"]).is_err());
        assert!(config(&["pummel", "-R0", "http://example.com/"]).is_err());
        assert!(config(&["pummel", "-R1", "-t4", "-c2", "http://example.com/"]).is_err());
    }

    #[test]
    fn splits_local_ip_list() {
        let cfg = config(&[
            "pummel",
            "-R1",
            "-i",
            "10.0.0.1,,fe80::1%eth0",
            "http://example.com/",
        ])
        .unwrap();

        assert_eq!(cfg.local_ips.len(), 2);
        assert_eq!(cfg.local_ips[0].ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.local_ips[1].iface.as_deref(), Some("eth0"));

        assert!(config(&["pummel", "-R1", "-i", "not-an-ip", "http://example.com/"]).is_err());
    }

    #[test]
    fn u_latency_implies_latency() {
        let cfg = config(&["pummel", "-R1", "-U", "http://example.com/"]).unwrap();
        assert!(cfg.latency && cfg.u_latency);
    }
}
