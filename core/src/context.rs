use chrono::{DateTime, NaiveDate, Utc};

use crate::timewindow::TimeWindow;

/// Everything a single request needs to know about who is asking and when.
/// Built once per request and passed down explicitly.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub uid: String,
    pub window: TimeWindow,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    #[must_use]
    pub fn new(uid: &str, window: TimeWindow, now: DateTime<Utc>) -> Self {
        Self {
            uid: uid.to_string(),
            window,
            now,
        }
    }

    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.window.local_day(self.now)
    }
}
