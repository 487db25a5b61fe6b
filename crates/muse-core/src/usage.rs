//! Weekly usage counters for the free tier.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// First day (Monday, UTC) of the week containing `at`.
#[must_use]
pub fn week_start(at: DateTime<Utc>) -> NaiveDate {
    let date = at.date_naive();
    date - chrono::Days::new(u64::from(date.weekday().num_days_from_monday()))
}

/// Images generated by a user in one week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    /// Counted user.
    pub user_id: UserId,
    /// Monday of the counted week.
    pub week_start: NaiveDate,
    /// Images produced by succeeded tasks.
    pub images_generated: u32,
}

impl UsageCounter {
    /// An empty counter.
    #[must_use]
    pub const fn new(user_id: UserId, week_start: NaiveDate) -> Self {
        Self {
            user_id,
            week_start,
            images_generated: 0,
        }
    }

    /// Add `images` to the counter, saturating.
    pub fn record(&mut self, images: u32) {
        self.images_generated = self.images_generated.saturating_add(images);
    }
}
