//! Sequential card tasks with bounded retry on contention.
//!
//! Another process holding the card (a middleware daemon, a second browser tab) shows up
//! as [TokenError::Contention]. Tasks are retried a fixed number of times with a pause in
//! between; every other error is returned immediately.
use super::{Result, TokenError};
use crate::ports::StatusSink;
use std::thread;
use std::time::Duration;

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Run `op` up to `attempts` times while it fails with [TokenError::Contention].
pub fn retry_on_contention<T>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(TokenError::Contention) if attempt < attempts => {
                tracing::warn!("token busy, retrying in {delay:?} ({attempt}/{attempts})");
                thread::sleep(delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Discrete progress over a number of steps known up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    max: i32,
    current: i32,
}

impl Progress {
    pub fn new(max: i32) -> Progress {
        Progress { max, current: 0 }
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn step(&mut self) {
        self.advance(1);
    }

    pub fn advance(&mut self, steps: i32) {
        self.current = (self.current + steps).min(self.max);
    }

    pub fn report(&self, status: &mut dyn StatusSink) {
        status.report_progress(self.max, self.current);
    }

    pub fn hide(status: &mut dyn StatusSink) {
        status.report_progress(-1, 0);
    }
}

/// Runs card tasks one after another, advancing progress after each success.
pub struct TaskRunner {
    attempts: u32,
    delay: Duration,
    progress: Progress,
}

impl TaskRunner {
    pub fn new(attempts: u32, delay: Duration, steps: i32) -> TaskRunner {
        TaskRunner {
            attempts,
            delay,
            progress: Progress::new(steps),
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn start(&self, status: &mut dyn StatusSink) {
        self.progress.report(status);
    }

    pub fn run<T>(
        &mut self,
        status: &mut dyn StatusSink,
        task: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        self.run_weighted(status, 1, task)
    }

    /// Like [TaskRunner::run], for a task worth `steps` units of progress.
    pub fn run_weighted<T>(
        &mut self,
        status: &mut dyn StatusSink,
        steps: i32,
        task: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let value = retry_on_contention(self.attempts, self.delay, task)?;
        self.progress.advance(steps);
        self.progress.report(status);
        Ok(value)
    }
}
