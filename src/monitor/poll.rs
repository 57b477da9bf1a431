//! Bounded suspend-and-retry loop.

use std::future::Future;
use std::time::Duration;

use crate::clock::Clock;

/// Call `attempt` up to `attempts` times until it yields `Some`.
///
/// Sleeps `interval` between attempts, never after the last one. Errors
/// end the loop immediately. `Ok(None)` means every attempt came back empty.
pub async fn poll_until<T, E, F, Fut>(
    clock: &dyn Clock,
    attempts: u32,
    interval: Duration,
    mut attempt: F,
) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for n in 1..=attempts {
        if let Some(found) = attempt(n).await? {
            return Ok(Some(found));
        }
        if n < attempts {
            clock.sleep(interval).await;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn exhausts_attempts_with_sleeps_between() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<Option<()>, String> =
            poll_until(&clock, 6, Duration::from_secs(5), |_| {
                calls += 1;
                async { Ok(None) }
            })
            .await;

        assert_eq!(result, Ok(None));
        assert_eq!(calls, 6);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 5]);
        assert_eq!(clock.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test]
    async fn stops_at_first_hit() {
        let clock = ManualClock::new();
        let result: Result<Option<u32>, String> =
            poll_until(&clock, 24, Duration::from_secs(5), |n| async move {
                Ok((n == 3).then_some(n))
            })
            .await;

        assert_eq!(result, Ok(Some(3)));
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn error_short_circuits() {
        let clock = ManualClock::new();
        let result: Result<Option<u32>, String> =
            poll_until(&clock, 5, Duration::from_secs(1), |n| async move {
                if n == 2 { Err("api down".to_string()) } else { Ok(None) }
            })
            .await;

        assert_eq!(result, Err("api down".to_string()));
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_never_calls() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<Option<u32>, String> =
            poll_until(&clock, 0, Duration::from_secs(1), |_| {
                calls += 1;
                async { Ok(Some(1)) }
            })
            .await;
        assert_eq!(result, Ok(None));
        assert_eq!(calls, 0);
    }
}
