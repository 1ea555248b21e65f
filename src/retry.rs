//! Bounded-retry discipline shared by every multi-attempt step.
//!
//! Unattended runs must terminate deterministically within a fixed number
//! of attempts; interactive runs defer the stop/continue decision to the
//! operator every time, even past the nominal ceiling.

/// What a multi-attempt step should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Stop,
    RetryNow,
    AskOperator,
}

/// Decide the next move after `attempt` recorded failures out of `max`.
pub fn decide(attempt: u32, max: u32, interactive: bool) -> Decision {
    if interactive {
        return Decision::AskOperator;
    }
    if attempt < max {
        Decision::RetryNow
    } else {
        Decision::Stop
    }
}

/// Counter state for one bounded-retry operation. Created at the start of
/// the operation and discarded at its end; never shared across operations.
#[derive(Debug)]
pub struct RetryContext {
    attempts: u32,
    max: u32,
    interactive: bool,
    last_failure: Option<String>,
}

impl RetryContext {
    pub fn new(max: u32, interactive: bool) -> Self {
        Self {
            attempts: 0,
            max,
            interactive,
            last_failure: None,
        }
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.attempts += 1;
        self.last_failure = Some(reason.into());
    }

    pub fn decide(&self) -> Decision {
        decide(self.attempts, self.max, self.interactive)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }
}

/// Run `op` up to `max` times (at least once), returning the first success
/// or the last error. The closure receives the 1-based attempt number.
pub fn with_attempts<T, E, F>(max: u32, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let max = max.max(1);
    let mut last = None;
    for attempt in 1..=max {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => last = Some(err),
        }
    }
    match last {
        Some(err) => Err(err),
        None => unreachable!("loop runs at least once"),
    }
}
