use hdrhistogram::Histogram;

use crate::{cfg::Config, engine::RunSummary, stats::Stats, units};

const PERCENTILES: [f64; 8] = [50.0, 75.0, 90.0, 99.0, 99.9, 99.99, 99.999, 100.0];

pub(crate) fn print(cfg: &Config, summary: &RunSummary) {
    let runtime_s = summary.runtime_us as f64 / 1_000_000.0;
    let req_per_s = summary.complete as f64 / runtime_s;
    let bytes_per_s = summary.bytes as f64 / runtime_s;

    print_stats_header();
    print_latency_stats(&summary.latency);
    print_request_stats(&summary.requests);

    if cfg.latency {
        print_hdr_latency(&summary.latency, "Recorded Latency");
        println!("----------------------------------------------------------");
    }

    if cfg.u_latency {
        println!();
        print_hdr_latency(
            &summary.u_latency,
            "Uncorrected Latency (measured without taking delayed starts into account)",
        );
        println!("----------------------------------------------------------");
    }

    println!(
        "  {} requests in {}, {}B read",
        summary.complete,
        units::format_time_us(summary.runtime_us as f64),
        units::format_binary(summary.bytes as f64)
    );

    if summary.errors.any_socket_errors() {
        println!(
            "  Socket errors: connect {}, read {}, write {}, timeout {}, reconnect {}",
            summary.errors.connect,
            summary.errors.read,
            summary.errors.write,
            summary.errors.timeout,
            summary.errors.reconnect
        );
    }

    if summary.errors.status != 0 {
        println!("  Non-2xx or 3xx responses: {}", summary.errors.status);
    }

    println!("Established connections: {}", summary.errors.established);
    println!("Requests/sec: {req_per_s:9.2}");
    println!("Transfer/sec: {:>10}B", units::format_binary(bytes_per_s));
}

fn print_stats_header() {
    println!("  Thread Stats{:>6}{:>11}{:>8}{:>12}", "Avg", "Stdev", "Max", "+/- Stdev");
}

fn print_latency_stats(hist: &Histogram<u64>) {
    let mean = hist.mean();
    let stdev = hist.stdev();
    let max = if hist.is_empty() { 0 } else { hist.max() };

    print_row(
        "Latency",
        mean,
        stdev,
        max as f64,
        within_stdev(hist, mean, stdev, 1.0),
        units::format_time_us,
    );
}

fn print_request_stats(stats: &Stats) {
    let mean = stats.mean();
    let stdev = stats.stdev();

    print_row(
        "Req/Sec",
        mean,
        stdev,
        stats.max() as f64,
        stats.within_stdev(mean, stdev, 1.0),
        units::format_metric,
    );
}

fn print_row(
    name: &str,
    mean: f64,
    stdev: f64,
    max: f64,
    within: f64,
    fmt: fn(f64) -> String,
) {
    print!("    {name:<10}");
    print_units(mean, fmt, 8);
    print_units(stdev, fmt, 10);
    print_units(max, fmt, 9);
    println!("{within:8.2}%");
}

/// Right-aligns a formatted value in `width` columns, trading trailing
/// padding for unit characters so the numbers line up.
fn print_units(n: f64, fmt: fn(f64) -> String, width: usize) {
    let msg = fmt(n);
    let bytes = msg.as_bytes();

    let mut pad = 2usize;
    if bytes.last().is_some_and(|b| b.is_ascii_alphabetic()) {
        pad -= 1;
    }
    if bytes.len() >= 2 && bytes[bytes.len() - 2].is_ascii_alphabetic() {
        pad -= 1;
    }
    let width = width.saturating_sub(pad);

    print!("{msg:>width$.width$}{}", &"  "[..pad]);
}

fn print_hdr_latency(hist: &Histogram<u64>, description: &str) {
    println!("  Latency Distribution (HdrHistogram - {description})");
    for p in PERCENTILES {
        let value = hist.value_at_quantile(p / 100.0);
        print!("{p:7.3}%");
        print_units(value as f64, units::format_time_us, 10);
        println!();
    }

    println!();
    println!("  Detailed Percentile spectrum:");
    print_percentile_spectrum(hist);
}

/// Full percentile spectrum with values scaled to milliseconds, five ticks
/// per half-distance.
fn print_percentile_spectrum(hist: &Histogram<u64>) {
    println!("{:>12} {:>14} {:>10} {:>14}", "Value", "Percentile", "TotalCount", "1/(1-Percentile)");

    let mut total = 0u64;
    for v in hist.iter_quantiles(5) {
        total += v.count_since_last_iteration();
        let value_ms = v.value_iterated_to() as f64 / 1000.0;
        let quantile = v.quantile_iterated_to();

        if quantile < 1.0 {
            println!(
                "{value_ms:12.3} {quantile:14.6} {total:10} {:14.2}",
                1.0 / (1.0 - quantile)
            );
        } else {
            println!("{value_ms:12.3} {quantile:14.6} {total:10} {:>14}", "inf");
        }
    }

    println!(
        "#[Mean    = {:12.3}, StdDeviation   = {:12.3}]",
        hist.mean() / 1000.0,
        hist.stdev() / 1000.0
    );
    println!(
        "#[Max     = {:12.3}, Total count    = {:12}]",
        if hist.is_empty() { 0.0 } else { hist.max() as f64 / 1000.0 },
        hist.len()
    );
}

fn within_stdev(hist: &Histogram<u64>, mean: f64, stdev: f64, band: f64) -> f64 {
    if hist.is_empty() {
        return 0.0;
    }

    let lower = mean - band * stdev;
    let upper = mean + band * stdev;
    let mut within = 0u64;

    for v in hist.iter_recorded() {
        let value = v.value_iterated_to() as f64;
        if value >= lower && value <= upper {
            within += v.count_at_value();
        }
    }

    within as f64 / hist.len() as f64 * 100.0
}
