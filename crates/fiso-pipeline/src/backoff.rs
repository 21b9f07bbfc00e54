use std::time::Duration;

use exponential_backoff::Backoff;

/// Symmetric jitter factor applied to every backoff delay (§9 "Backoff
/// jitter"): ±20% of the computed base, to avoid retry synchronization
/// across workers.
const JITTER: f32 = 0.2;
const FACTOR: u32 = 2;

/// Computes the sleep durations between sink-delivery attempts (§4.4): the
/// first retry after `initial_interval`, doubling each attempt, capped at
/// `max_interval`, with the jitter above. `retries` is the number of
/// backoff waits needed (attempts - 1); a flow with one attempt needs none.
pub(crate) fn delays(retries: usize, initial_interval: Duration, max_interval: Duration) -> Vec<Duration> {
    if retries == 0 {
        return Vec::new();
    }
    let mut backoff = Backoff::new(retries as u32, initial_interval, max_interval);
    backoff.set_factor(FACTOR);
    backoff.set_jitter(JITTER);
    (&backoff).into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_retries_yields_no_delays() {
        assert!(delays(0, Duration::from_millis(1), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn delays_are_bounded_by_max_interval() {
        let ds = delays(10, Duration::from_millis(10), Duration::from_millis(100));
        for d in ds {
            assert!(d <= Duration::from_millis(120));
        }
    }
}
