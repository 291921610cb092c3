//! Clock abstraction.
//!
//! Lease arithmetic and staleness detection are all relative to "now", so
//! the clock is injected rather than read ambiently. Production code uses
//! [`SystemClock`]; tests drive a manual clock from `crate::testing`.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
