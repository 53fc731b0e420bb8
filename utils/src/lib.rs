use std::time::SystemTime;

pub mod backoff;

pub use backoff::{delay_with_backoff, BackoffPolicy};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_time_is_monotonic_enough() {
        let a = get_epoch_time_in_ms();
        let b = get_epoch_time_in_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
