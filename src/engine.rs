use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::Builder,
};

use anyhow::anyhow;
use bytes::Bytes;
use hdrhistogram::Histogram;
use thiserror::Error;

use crate::{
    cfg::{Config, Scheme},
    net, report,
    script::{Script, StaticScript, ThreadInfo},
    stats::{Errors, Stats},
    time_us, units,
    worker::{Worker, WorkerParams},
    MAX_LATENCY_US,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to create thread {idx}: {source}")]
    Spawn { idx: u64, source: io::Error },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// State shared between workers and the coordinator.
pub(crate) struct Shared {
    /// Set from the SIGINT handler, polled by every reactor.
    pub stop: AtomicBool,
    /// Workers that finished every handshake, and the flag raised when all
    /// of them did. Both are monotone.
    pub ready_workers: AtomicUsize,
    pub all_ready: AtomicBool,
    /// Throughput samples recorded once per worker per sampling interval.
    pub requests: Mutex<Stats>,
}

/// Aggregate results of one run, as printed in the report.
pub struct RunSummary {
    pub runtime_us: u64,
    pub complete: u64,
    pub bytes: u64,
    pub errors: Errors,
    pub latency: Histogram<u64>,
    pub u_latency: Histogram<u64>,
    pub requests: Stats,
}

type ScriptFn = Box<dyn Fn(&Config) -> Box<dyn Script>>;

/// Spawns the worker threads, waits them out and merges their results.
pub struct Engine {
    cfg: Arc<Config>,
    script_fn: ScriptFn,
}

impl Engine {
    pub fn new(cfg: Config) -> Self {
        fn static_script(cfg: &Config) -> Box<dyn Script> {
            Box::new(StaticScript::from_config(cfg))
        }

        Self::with_script(cfg, static_script)
    }

    /// Runs with a custom script implementation, constructed once per worker
    /// thread plus once for the coordinator's hooks.
    pub fn with_script<F>(cfg: Config, script_fn: F) -> Self
    where
        F: Fn(&Config) -> Box<dyn Script> + 'static,
    {
        Self {
            cfg: Arc::new(cfg),
            script_fn: Box::new(script_fn),
        }
    }

    pub fn run(self) -> Result<RunSummary, EngineError> {
        let cfg = self.cfg.clone();

        if let Some(path) = &cfg.script {
            return Err(anyhow!(
                "no scripting engine is compiled into this build, cannot load {}",
                path.display()
            )
            .into());
        }

        let mut proto = (self.script_fn)(&cfg);
        let addrs = proto
            .resolve(&cfg.host, cfg.port)
            .map_err(|e| anyhow!("unable to connect to {}:{}: {e}", cfg.host, cfg.port))?;
        let addr = *addrs
            .first()
            .ok_or_else(|| anyhow!("unable to resolve {}:{}", cfg.host, cfg.port))?;

        let pipeline = proto.verify_request().max(1);
        let dynamic = !proto.is_static();
        let want_response = proto.want_response();
        let request = if dynamic { Bytes::new() } else { proto.request() };

        let server_name = match cfg.scheme {
            Scheme::Https => Some(
                net::server_name(&cfg.host)
                    .map_err(|e| anyhow!("invalid TLS server name {}: {e}", cfg.host))?,
            ),
            Scheme::Http => None,
        };

        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            ready_workers: AtomicUsize::new(0),
            all_ready: AtomicBool::new(false),
            requests: Mutex::new(Stats::new()),
        });

        {
            let shared = shared.clone();
            if let Err(e) = ctrlc::set_handler(move || shared.stop.store(true, Ordering::SeqCst)) {
                log::warn!("unable to install SIGINT handler: {e}");
            }
        }

        let startup = time_us();
        let stop_at = startup + cfg.duration.as_micros() as u64;

        println!(
            "Running {} test @ {}",
            units::format_time_s(cfg.duration.as_secs() as f64),
            cfg.url
        );
        println!("  {} threads and {} connections", cfg.threads, cfg.connections);

        let connections = cfg.connections / cfg.threads;
        let throughput = cfg.rate as f64 / cfg.threads as f64;

        let mut threads = Vec::with_capacity(cfg.threads as usize);
        for idx in 0..cfg.threads {
            let mut script = (self.script_fn)(&cfg);
            let local_ip = if cfg.local_ips.is_empty() {
                None
            } else {
                Some(cfg.local_ips[idx as usize % cfg.local_ips.len()].clone())
            };

            let info = ThreadInfo {
                id: idx as usize,
                local_ip: local_ip.as_ref().map(ToString::to_string),
                first_local_ip: cfg.local_ips.first().map(ToString::to_string),
            };
            script.init(&info, &[]);

            let worker = Worker::new(WorkerParams {
                id: idx as usize,
                cfg: cfg.clone(),
                shared: shared.clone(),
                addr,
                script,
                request: request.clone(),
                pipeline,
                dynamic,
                want_response,
                connections,
                throughput,
                local_ip,
                server_name: server_name.clone(),
                stop_at,
            })
            .map_err(|e| anyhow!("unable to create worker {idx}: {e}"))?;

            let thread = Builder::new()
                .name(format!("pummel:{idx:02}"))
                .spawn(move || worker.run())
                .map_err(|source| EngineError::Spawn { idx, source })?;

            threads.push(thread);
        }

        let mut outputs = Vec::with_capacity(threads.len());
        for thread in threads {
            let output = thread
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
            outputs.push(output);
        }

        // With the warmup phase enabled, runtime is measured from the first
        // transition into the normal phase.
        let start = outputs
            .iter()
            .map(|o| o.phase_normal_start)
            .filter(|&t| t != 0)
            .min()
            .unwrap_or(startup);
        let runtime_us = time_us() - start;

        let mut complete = 0;
        let mut bytes = 0;
        let mut errors = Errors::default();
        let mut latency = new_histogram();
        let mut u_latency = new_histogram();

        for output in &outputs {
            complete += output.complete;
            bytes += output.bytes;
            errors.merge(&output.errors);
            latency
                .add(&output.latency)
                .map_err(|e| anyhow!("latency histogram merge failed: {e}"))?;
            u_latency
                .add(&output.u_latency)
                .map_err(|e| anyhow!("latency histogram merge failed: {e}"))?;
        }

        let requests = shared
            .requests
            .lock()
            .map_err(|_| anyhow!("throughput stats lock poisoned"))?
            .clone();

        let summary = RunSummary {
            runtime_us,
            complete,
            bytes,
            errors,
            latency,
            u_latency,
            requests,
        };

        report::print(&cfg, &summary);

        if proto.has_done() {
            proto.summary(summary.runtime_us, summary.complete, summary.bytes);
            proto.errors(&summary.errors);
            proto.done(&summary.latency, &summary.requests);
        }

        Ok(summary)
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_LATENCY_US, 3).expect("histogram bounds are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merging_histograms_preserves_percentiles() {
        let mut merged = new_histogram();
        let mut single = new_histogram();
        let mut parts = Vec::new();

        for worker in 0..4u64 {
            let mut part = new_histogram();
            for i in 0..10_000u64 {
                // An arbitrary spread across several orders of magnitude.
                let sample = (i % 997 + 1) * (worker + 1) * 37;
                part.saturating_record(sample);
                single.saturating_record(sample);
            }
            parts.push(part);
        }
        for part in &parts {
            merged.add(part).unwrap();
        }

        assert_eq!(merged.len(), single.len());
        for q in [0.5, 0.75, 0.9, 0.99, 0.999, 1.0] {
            let a = merged.value_at_quantile(q) as f64;
            let b = single.value_at_quantile(q) as f64;
            // Identical within the histogram's 3-significant-digit precision.
            assert!((a - b).abs() <= a * 0.001, "q={q}: {a} != {b}");
        }
    }
}
