//! Probe doubles shared by the unit tests

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::probe::Probe;

/// Owned key list from string literals.
pub fn keys(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Accepts exactly the keys it was built with and counts calls.
pub struct AllowListProbe {
    valid: HashSet<String>,
    calls: AtomicUsize,
}

impl AllowListProbe {
    pub fn new(valid: &[&str]) -> Self {
        Self {
            valid: valid.iter().map(|v| v.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Probe for AllowListProbe {
    fn check<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.valid.contains(key)
        })
    }
}

/// Accepts every key after `delay`, recording the peak number of overlapping checks.
pub struct InFlightProbe {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightProbe {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Probe for InFlightProbe {
    fn check<'a>(&'a self, _key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            true
        })
    }
}
