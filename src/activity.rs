//! Last-request activity tracking for Hub idle-culling reports.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::sync::{read_or_recover, write_or_recover};

/// Records the timestamp of the most recent forwarded request. The activity
/// reporter reads it on every tick; `None` means no request has been
/// forwarded yet.
#[derive(Default)]
pub struct Tracker {
    last: RwLock<Option<DateTime<Utc>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        *write_or_recover(&self.last) = Some(Utc::now());
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *read_or_recover(&self.last)
    }
}
