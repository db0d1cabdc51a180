//! End-to-end runs against an in-process stub HTTP server.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
};

use bytes::Bytes;
use clap::Parser;
use pummel::{
    cfg::Config,
    cmd::Cmd,
    engine::{Engine, RunSummary},
    script::Script,
};

const KEEP_ALIVE_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
const CLOSE_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok";

/// Serves `response` once per received request; closes the connection after
/// each response when `close_after_response` is set. `stall_at` makes the
/// stub sleep 500 ms once, just before its n-th response on a connection.
fn spawn_stub_with(
    response: &'static [u8],
    close_after_response: bool,
    stall_at: Option<usize>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            thread::spawn(move || serve_connection(stream, response, close_after_response, stall_at));
        }
    });

    addr
}

fn spawn_stub(response: &'static [u8], close_after_response: bool) -> SocketAddr {
    spawn_stub_with(response, close_after_response, None)
}

fn serve_connection(
    mut stream: TcpStream,
    response: &[u8],
    close_after_response: bool,
    stall_at: Option<usize>,
) {
    let mut buf = [0u8; 4096];
    // Rolling window over the last three bytes so a request terminator split
    // across reads is still seen.
    let mut tail = [0u8; 3];
    let mut tail_len = 0usize;
    let mut served = 0usize;

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        let mut window = Vec::with_capacity(tail_len + n);
        window.extend_from_slice(&tail[..tail_len]);
        window.extend_from_slice(&buf[..n]);

        let requests = window.windows(4).filter(|&w| w == b"\r\n\r\n").count();

        tail_len = window.len().min(3);
        tail[..tail_len].copy_from_slice(&window[window.len() - tail_len..]);

        for _ in 0..requests {
            served += 1;
            if stall_at == Some(served) {
                thread::sleep(std::time::Duration::from_millis(500));
            }
            if stream.write_all(response).is_err() {
                return;
            }
            if close_after_response {
                return;
            }
        }
    }
}

fn config(args: &[&str]) -> Config {
    Cmd::parse_from(args).try_into().expect("valid config")
}

fn run(args: &[&str], addr: SocketAddr) -> RunSummary {
    let mut full = args.to_vec();
    let url = format!("http://{addr}/");
    full.push(&url);
    Engine::new(config(&full)).run().expect("engine run")
}

#[test]
fn deadline_stops_the_run_at_the_expected_request_count() {
    let addr = spawn_stub(KEEP_ALIVE_RESPONSE, false);

    let summary = run(&["pummel", "-t1", "-c1", "-d2s", "-R500"], addr);

    // 500 req/s for 2s, with slack for calibration overhead.
    assert!(
        summary.complete >= 800 && summary.complete <= 1150,
        "complete = {}",
        summary.complete
    );
    assert!(summary.runtime_us < 3_500_000, "runtime = {}us", summary.runtime_us);
    assert_eq!(summary.errors.status, 0);
    assert!(summary.errors.established >= 1);
    assert!(summary.bytes > 0);
    assert!(!summary.latency.is_empty());
}

#[test]
fn connection_close_reconnects_the_same_slot() {
    let addr = spawn_stub(CLOSE_RESPONSE, true);

    let summary = run(&["pummel", "-t1", "-c1", "-d1s", "-R50"], addr);

    // Every response forbids keep-alive, so the slot must reconnect and keep
    // issuing requests.
    assert!(summary.complete >= 3, "complete = {}", summary.complete);
    assert!(
        summary.errors.reconnect >= 2,
        "reconnect = {}",
        summary.errors.reconnect
    );
    assert_eq!(summary.errors.status, 0);
}

#[test]
fn warmup_runs_measure_from_the_phase_transition() {
    let addr = spawn_stub(KEEP_ALIVE_RESPONSE, false);

    let summary = run(&["pummel", "-t2", "-c2", "-d2s", "-R100", "-W"], addr);

    assert!(summary.complete > 0, "complete = {}", summary.complete);
    // Runtime is dated from the warmup-to-normal transition, which happens
    // within the first thread-sync interval on a loopback target.
    assert!(summary.runtime_us < 2_500_000, "runtime = {}us", summary.runtime_us);
    assert!(summary.errors.established >= 2);
}

#[test]
fn a_stalling_target_shows_up_only_in_corrected_latencies() {
    let addr = spawn_stub_with(KEEP_ALIVE_RESPONSE, false, Some(100));

    let summary = run(&["pummel", "-t1", "-c1", "-d2s", "-R200"], addr);

    // The 500 ms stall delays the expected start of every request queued
    // behind it, so the corrected distribution carries a whole tail of
    // stall-sized samples. The uncorrected one only sees the single response
    // that physically waited.
    let corrected_tail = summary.latency.count_between(200_000, pummel::MAX_LATENCY_US);
    let uncorrected_tail = summary.u_latency.count_between(200_000, pummel::MAX_LATENCY_US);

    assert!(corrected_tail >= 10, "corrected tail = {corrected_tail}");
    assert!(uncorrected_tail <= 3, "uncorrected tail = {uncorrected_tail}");
    assert!(summary.complete >= 150, "complete = {}", summary.complete);
}

struct PipelinedScript {
    request: Bytes,
    depth: u64,
}

impl PipelinedScript {
    fn new(depth: u64) -> Self {
        let one = b"GET / HTTP/1.1\r\nHost: stub\r\n\r\n";
        let mut blob = Vec::new();
        for _ in 0..depth {
            blob.extend_from_slice(one);
        }
        Self {
            request: Bytes::from(blob),
            depth,
        }
    }
}

impl Script for PipelinedScript {
    fn request(&mut self) -> Bytes {
        self.request.clone()
    }

    fn verify_request(&mut self) -> u64 {
        self.depth
    }
}

fn pipelined_script(_: &Config) -> Box<dyn Script> {
    Box::new(PipelinedScript::new(4))
}

#[test]
fn batch_latency_records_one_sample_per_pipelined_batch() {
    let addr = spawn_stub(KEEP_ALIVE_RESPONSE, false);
    let url = format!("http://{addr}/");

    let cfg = config(&["pummel", "-t1", "-c1", "-d2s", "-R200", "-B", &url]);
    let summary = Engine::with_script(cfg, pipelined_script)
        .run()
        .expect("engine run");

    assert!(summary.complete >= 40, "complete = {}", summary.complete);

    // One corrected and one uncorrected sample per batch of four.
    let batches = summary.complete / 4;
    let recorded = summary.latency.len();
    assert!(
        recorded <= batches + 2 && recorded + 2 >= batches,
        "complete = {}, recorded = {recorded}",
        summary.complete
    );
    assert_eq!(summary.latency.len(), summary.u_latency.len());
}

#[test]
fn record_all_keeps_every_pipelined_sample() {
    let addr = spawn_stub(KEEP_ALIVE_RESPONSE, false);
    let url = format!("http://{addr}/");

    let cfg = config(&["pummel", "-t1", "-c1", "-d2s", "-R200", &url]);
    let summary = Engine::with_script(cfg, pipelined_script)
        .run()
        .expect("engine run");

    // All responses are recorded, give or take the stop-crossing tail.
    assert!(
        summary.latency.len() + 4 >= summary.complete,
        "complete = {}, recorded = {}",
        summary.complete,
        summary.latency.len()
    );
}
