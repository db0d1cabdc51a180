use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum UnitsError {
    #[error("invalid number: {0:?}")]
    BadNumber(String),
    #[error("invalid unit suffix: {0:?}")]
    BadSuffix(String),
}

fn split_suffix(s: &str) -> (&str, &str) {
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    s.split_at(digits)
}

/// Scans a numeric argument with an optional SI suffix (1k, 1M, 1G).
pub fn scan_metric(s: &str) -> Result<u64, UnitsError> {
    let (num, suffix) = split_suffix(s);
    let base: u64 = num.parse().map_err(|_| UnitsError::BadNumber(s.into()))?;

    let scale = match suffix {
        "" => 1,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        _ => return Err(UnitsError::BadSuffix(s.into())),
    };

    Ok(base * scale)
}

/// Scans a time argument with an optional unit suffix (2s, 2m, 2h).
/// Returns seconds.
pub fn scan_time(s: &str) -> Result<u64, UnitsError> {
    let (num, suffix) = split_suffix(s);
    let base: u64 = num.parse().map_err(|_| UnitsError::BadNumber(s.into()))?;

    let scale = match suffix {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(UnitsError::BadSuffix(s.into())),
    };

    Ok(base * scale)
}

struct Units {
    scale: f64,
    base: &'static str,
    units: &'static [&'static str],
}

const TIME_UNITS_US: Units = Units {
    scale: 1000.0,
    base: "us",
    units: &["ms", "s"],
};

const TIME_UNITS_S: Units = Units {
    scale: 60.0,
    base: "s",
    units: &["m", "h"],
};

const BINARY_UNITS: Units = Units {
    scale: 1024.0,
    base: "",
    units: &["K", "M", "G", "T", "P"],
};

const METRIC_UNITS: Units = Units {
    scale: 1000.0,
    base: "",
    units: &["k", "M", "G", "T", "P"],
};

fn format_units(mut n: f64, units: &Units, precision: usize) -> String {
    let mut unit = units.base;

    for next in units.units {
        if n < units.scale {
            break;
        }
        n /= units.scale;
        unit = next;
    }

    let mut s = format!("{:.*}", precision, n);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s.push_str(unit);
    s
}

pub fn format_binary(n: f64) -> String {
    format_units(n, &BINARY_UNITS, 2)
}

pub fn format_metric(n: f64) -> String {
    format_units(n, &METRIC_UNITS, 2)
}

pub fn format_time_us(n: f64) -> String {
    if n >= 1_000_000.0 {
        format_time_s(n / 1_000_000.0)
    } else {
        format_units(n, &TIME_UNITS_US, 2)
    }
}

pub fn format_time_s(n: f64) -> String {
    format_units(n, &TIME_UNITS_S, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_suffixes() {
        assert_eq!(scan_metric("10").unwrap(), 10);
        assert_eq!(scan_metric("2k").unwrap(), 2_000);
        assert_eq!(scan_metric("2K").unwrap(), 2_000);
        assert_eq!(scan_metric("3M").unwrap(), 3_000_000);
        assert_eq!(scan_metric("1G").unwrap(), 1_000_000_000);
        assert!(scan_metric("1q").is_err());
        assert!(scan_metric("").is_err());
        assert!(scan_metric("k").is_err());
    }

    #[test]
    fn time_suffixes() {
        assert_eq!(scan_time("10").unwrap(), 10);
        assert_eq!(scan_time("10s").unwrap(), 10);
        assert_eq!(scan_time("2m").unwrap(), 120);
        assert_eq!(scan_time("1h").unwrap(), 3600);
        assert!(scan_time("5d").is_err());
    }

    #[test]
    fn formats_time() {
        assert_eq!(format_time_us(250.0), "250us");
        assert_eq!(format_time_us(1500.0), "1.5ms");
        assert_eq!(format_time_us(2_000_000.0), "2s");
        assert_eq!(format_time_us(120_000_000.0), "2m");
        assert_eq!(format_time_s(10.0), "10s");
        assert_eq!(format_time_s(3600.0), "1h");
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_binary(512.0), "512");
        assert_eq!(format_binary(2048.0), "2K");
        assert_eq!(format_binary(1024.0 * 1024.0 * 3.0), "3M");
        assert_eq!(format_metric(1000.0), "1k");
        assert_eq!(format_metric(1_230_000.0), "1.23M");
    }
}
