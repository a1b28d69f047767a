//! Polling wait loop.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Poll `condition` every `step` until it returns true or `timeout` elapses.
///
/// At least one attempt is made even with a zero timeout. Errors from the
/// condition propagate immediately; a timeout is reported as
/// [`Error::Timeout`] naming `what`.
pub fn wait_for(
    what: &str,
    timeout: Duration,
    step: Duration,
    mut condition: impl FnMut() -> Result<bool>,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if condition()? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::Timeout {
                what: what.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_when_condition_turns_true() {
        let mut calls = 0;
        let result = wait_for(
            "countdown",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || {
                calls += 1;
                Ok(calls >= 3)
            },
        );
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_timeout_still_makes_one_attempt() {
        let mut calls = 0;
        let result = wait_for("nothing", Duration::ZERO, Duration::from_millis(1), || {
            calls += 1;
            Ok(true)
        });
        assert!(result.is_ok());
        assert_eq!(calls, 1);

        let result = wait_for("nothing", Duration::ZERO, Duration::from_millis(1), || {
            Ok(false)
        });
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[test]
    fn makes_at_least_timeout_over_step_attempts() {
        let mut calls = 0u32;
        let result = wait_for(
            "never",
            Duration::from_millis(50),
            Duration::from_millis(10),
            || {
                calls += 1;
                Ok(false)
            },
        );
        assert!(result.is_err());
        assert!(calls >= 5);
    }

    #[test]
    fn condition_errors_propagate() {
        let result = wait_for(
            "broken probe",
            Duration::from_secs(1),
            Duration::from_millis(1),
            || Err(Error::host("probe exploded")),
        );
        assert_eq!(result.unwrap_err().to_string(), "probe exploded");
    }
}
