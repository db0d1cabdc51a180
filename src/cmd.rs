use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::units;

/// Constant-throughput HTTP benchmarking tool.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
#[command(disable_version_flag = true)]
pub struct Cmd {
    /// Target URL.
    #[clap(required = true)]
    pub url: String,
    /// Connections to keep open, total across all threads.
    #[clap(short, long, value_parser = units::scan_metric, default_value = "10")]
    pub connections: u64,
    /// Number of threads to use.
    #[clap(short, long, value_parser = units::scan_metric, default_value = "2")]
    pub threads: u64,
    /// Duration of the test.
    #[clap(short, long, value_parser = units::scan_time, default_value = "10s")]
    pub duration: u64,
    /// Work rate (throughput) in requests/sec, total across all connections.
    #[clap(short = 'R', long, value_parser = units::scan_metric, required = true)]
    pub rate: u64,
    /// Load a script file customizing requests, responses and summaries.
    #[clap(short, long)]
    pub script: Option<PathBuf>,
    /// Add a header to the request. May be given multiple times.
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,
    /// Socket/request timeout.
    #[clap(short = 'T', long, value_parser = units::scan_time, default_value = "2s")]
    pub timeout: u64,
    /// Print latency statistics.
    #[clap(short = 'L', long)]
    pub latency: bool,
    /// Additionally print uncorrected latency statistics, measured without
    /// taking delayed starts into account.
    #[clap(short = 'U', long)]
    pub u_latency: bool,
    /// Measure latency of whole batches of pipelined ops, as opposed to each
    /// op.
    #[clap(short = 'B', long)]
    pub batch_latency: bool,
    /// Enable the warmup phase.
    ///
    /// In the warmup phase connections are established, but no requests are
    /// sent.
    #[clap(short = 'W', long)]
    pub warmup: bool,
    /// Bind to the specified local IP(s). It can be a comma separated list;
    /// an IPv6 address may carry a `%iface` scope suffix.
    #[clap(short = 'i', long = "local_ip")]
    pub local_ip: Option<String>,
    /// Print version details.
    #[clap(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
    /// Be verbose in terms of logging.
    #[clap(long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_surface() {
        let cmd = Cmd::parse_from([
            "pummel",
            "-t4",
            "-c400",
            "-d30s",
            "-R",
            "2k",
            "-H",
            "X-Bench: 1",
            "-L",
            "-W",
            "http://localhost:8080/",
        ]);

        assert_eq!(cmd.threads, 4);
        assert_eq!(cmd.connections, 400);
        assert_eq!(cmd.duration, 30);
        assert_eq!(cmd.rate, 2000);
        assert_eq!(cmd.headers, vec!["X-Bench: 1".to_owned()]);
        assert!(cmd.latency);
        assert!(cmd.warmup);
        assert_eq!(cmd.url, "http://localhost:8080/");
    }

    #[test]
    fn rate_is_required() {
        assert!(Cmd::try_parse_from(["pummel", "http://localhost/"]).is_err());
    }
}
