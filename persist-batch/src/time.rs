use chrono::{DateTime, Utc};

pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Milliseconds elapsed between two instants, clamped at zero.
pub fn elapsed_ms(start: &DateTime<Utc>, end: &DateTime<Utc>) -> u64 {
    u64::try_from(end.signed_duration_since(*start).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_elapsed_ms() {
        let start = Utc::now();

        assert_eq!(elapsed_ms(&start, &(start + Duration::milliseconds(1500))), 1500);
        assert_eq!(elapsed_ms(&start, &start), 0);
        assert_eq!(elapsed_ms(&start, &(start - Duration::seconds(5))), 0);
    }
}
