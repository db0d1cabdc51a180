use std::{sync::OnceLock, time::Instant};

pub mod cfg;
pub mod cmd;
mod connection;
pub mod engine;
mod http;
pub mod logging;
mod net;
mod pacer;
mod reactor;
mod report;
pub mod script;
pub mod stats;
pub mod units;
mod worker;

/// Maximum recordable latency: one day, in microseconds.
pub const MAX_LATENCY_US: u64 = 24 * 60 * 60 * 1_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic microsecond clock shared by every thread.
///
/// All absolute timestamps in this crate (pacing schedules, deadlines, phase
/// transitions) are microseconds on this clock.
#[inline]
pub fn time_us() -> u64 {
    epoch().elapsed().as_micros() as u64
}
