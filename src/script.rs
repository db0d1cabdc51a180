use std::{
    fmt::Write as _,
    io,
    net::{SocketAddr, ToSocketAddrs},
};

use bytes::Bytes;
use hdrhistogram::Histogram;

use crate::{
    cfg::Config,
    stats::{Errors, Stats},
};

/// Per-worker context handed to `Script::init`.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: usize,
    /// Local bind address assigned to this worker, when configured.
    pub local_ip: Option<String>,
    /// First configured local IP, identical for every worker.
    pub first_local_ip: Option<String>,
}

/// Hook surface for customizing requests, responses and summaries.
///
/// No scripting engine is compiled in; the load-generation core runs against
/// any implementation of this trait, normally [`StaticScript`].
pub trait Script: Send {
    fn resolve(&mut self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        (host, port).to_socket_addrs().map(|addrs| addrs.collect())
    }

    fn init(&mut self, _thread: &ThreadInfo, _args: &[String]) {}

    /// Produces the next request blob to put on the wire.
    fn request(&mut self) -> Bytes;

    /// Number of pipelined requests contained in one request blob.
    fn verify_request(&mut self) -> u64 {
        1
    }

    /// Whether `request` returns the same blob every time. A static request
    /// is fetched once and shared by every connection.
    fn is_static(&self) -> bool {
        true
    }

    /// Whether response headers and bodies should be captured and fed to
    /// [`Script::response`].
    fn want_response(&self) -> bool {
        false
    }

    /// Called per completed response when `want_response` is set. Headers
    /// arrive as `name\0value\0` pairs.
    fn response(&mut self, _status: u16, _headers: &[u8], _body: &[u8]) {}

    fn has_done(&self) -> bool {
        false
    }

    fn summary(&mut self, _runtime_us: u64, _complete: u64, _bytes: u64) {}

    fn errors(&mut self, _errors: &Errors) {}

    fn done(&mut self, _latency: &Histogram<u64>, _requests: &Stats) {}
}

/// Request source when no script is loaded: a compiled-in HTTP/1.1 template
/// built once from the target URL and extra headers.
#[derive(Debug, Clone)]
pub struct StaticScript {
    request: Bytes,
}

impl StaticScript {
    pub fn from_config(cfg: &Config) -> Self {
        let mut req = String::new();
        let _ = write!(req, "GET {} HTTP/1.1\r\n", cfg.path);
        let _ = write!(req, "Host: {}\r\n", cfg.host);
        for header in &cfg.headers {
            req.push_str(header);
            req.push_str("\r\n");
        }
        req.push_str("\r\n");

        Self {
            request: Bytes::from(req),
        }
    }
}

impl Script for StaticScript {
    fn request(&mut self) -> Bytes {
        self.request.clone()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cmd::Cmd;

    #[test]
    fn builds_request_template() {
        let cmd = Cmd::parse_from([
            "pummel",
            "-R1",
            "-H",
            "Accept: */*",
            "http://example.com:8080/x?y=1",
        ]);
        let cfg: Config = cmd.try_into().unwrap();
        let mut script = StaticScript::from_config(&cfg);

        let request = script.request();
        assert_eq!(
            &request[..],
            b"GET /x?y=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n".as_slice(),
        );
        assert_eq!(script.verify_request(), 1);
        assert!(script.is_static());
    }
}
