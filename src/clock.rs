use std::time::Duration;

use chrono::{DateTime, Utc};

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// UTC wall-clock time as `YYYY-MM-DD HH:MM:SS`, for log headers and JSON
/// summaries.
pub fn timestamp() -> String {
    Utc::now().format(STAMP_FORMAT).to_string()
}

pub fn format_unix(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .map(|dt| dt.format(STAMP_FORMAT).to_string())
        .unwrap_or_else(|| format!("@{:}", secs))
}

/// `1h 02m 03s` style, used in progress output.
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{:}h {:02}m {:02}s", secs / 3600, (secs / 60) % 60, secs % 60)
    } else if secs >= 60 {
        format!("{:}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_dates() {
        assert_eq!(format_unix(0), "1970-01-01 00:00:00");
        assert_eq!(format_unix(951_782_400), "2000-02-29 00:00:00");
        assert_eq!(format_unix(1_700_000_000), "2023-11-14 22:13:20");
    }

    #[test]
    fn timestamp_shape() {
        let now = timestamp();
        assert_eq!(now.len(), 19);
        assert_eq!(&now[4..5], "-");
        assert_eq!(&now[10..11], " ");
    }

    #[test]
    fn durations() {
        assert_eq!(human_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(human_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(human_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }
}
