//! Time-bucketed retention ("purge") algorithm.
//!
//! Given a set of items keyed by timestamp, decides which to keep and
//! returns the rest, sorted oldest-first, as candidates for deletion.
//! The keep-set is the union of six buckets, each preserving a decreasing
//! density of history the further back in time it looks:
//!
//! - every item from the last 24h (`yesterday_plus`)
//! - one per day for the last week (`one_per_day_last_week`)
//! - one per week for the last month (`one_per_week_last_month`)
//! - one per month for the last year (`one_per_month_last_year`)
//! - one per calendar year, across all time (`one_per_year`)
//! - everything before an optional `start` cutoff (`past`), so callers can
//!   exempt an initial grace period from purging entirely.

use std::collections::HashSet;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, TimeDelta};

/// Decides which of `items` to keep and returns the rest.
///
/// `key` extracts the timestamp `purge` buckets on. `end` anchors "now" for
/// the relative buckets (yesterday/last week/last month/last year); `start`,
/// if set, exempts everything before it via the `past` bucket.
///
/// Builds a keep-set via the six buckets described at module level, then
/// returns every other item sorted ascending by `key`.
pub struct Purger<T, K> {
    items: Vec<T>,
    key: K,
    start: Option<NaiveDateTime>,
    end: NaiveDateTime,
}

impl<T, K> Purger<T, K>
where
    T: Clone,
    K: Fn(&T) -> NaiveDateTime,
{
    pub fn new(items: impl IntoIterator<Item = T>, key: K, end: NaiveDateTime) -> Self {
        Self {
            items: items.into_iter().collect(),
            key,
            start: None,
            end,
        }
    }

    /// Exempt everything at or after `start` from the `past` bucket, i.e.
    /// everything strictly before `start` is always kept.
    pub fn with_start(mut self, start: NaiveDateTime) -> Self {
        self.start = Some(start);
        self
    }

    /// Items not in the keep-set, sorted ascending by `key`.
    pub fn purge(&self) -> Vec<T> {
        let mut keep: HashSet<usize> = HashSet::new();
        keep.extend(self.yesterday_plus());
        keep.extend(self.one_per_day_last_week());
        keep.extend(self.one_per_week_last_month());
        keep.extend(self.one_per_month_last_year());
        keep.extend(self.one_per_year());
        keep.extend(self.past());

        let mut condemned: Vec<usize> = (0..self.items.len()).filter(|i| !keep.contains(i)).collect();
        condemned.sort_by_key(|&i| (self.key)(&self.items[i]));
        condemned.into_iter().map(|i| self.items[i].clone()).collect()
    }

    /// Indices of items whose key falls in `[start, end]` inclusive.
    pub fn filter_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<usize> {
        (0..self.items.len())
            .filter(|&i| {
                let k = (self.key)(&self.items[i]);
                start <= k && k <= end
            })
            .collect()
    }

    /// Indices of items from the last 24h, truncated to midnight.
    pub fn yesterday_plus(&self) -> Vec<usize> {
        let yesterday = midnight(self.end - TimeDelta::hours(24));
        (0..self.items.len())
            .filter(|&i| (self.key)(&self.items[i]) >= yesterday)
            .collect()
    }

    /// Indices of the latest item per day, for each of the last 7 days.
    pub fn one_per_day_last_week(&self) -> Vec<usize> {
        let last_week = midnight(self.end) - TimeDelta::days(7);
        let mut out = Vec::new();
        for i in 0..7 {
            let day = last_week + TimeDelta::days(i);
            let end_of_day = end_of_day(day);
            out.extend(self.latest_in(day, end_of_day));
        }
        out
    }

    /// Indices of the latest item per week, for the month before this one.
    pub fn one_per_week_last_month(&self) -> Vec<usize> {
        let today = midnight(self.end);
        let last_month = today - TimeDelta::days(31);
        let start_of_month = first_of_month(last_month);
        let end_of_month = first_of_month(today) - TimeDelta::days(1);

        let mut out = Vec::new();
        let mut start_day = start_of_month;
        while start_day <= end_of_month {
            let weekday = start_day.weekday().num_days_from_monday() as i64;
            let target_day = 6 - weekday + start_day.day() as i64;
            let end_of_week_date = u32::try_from(target_day)
                .ok()
                .and_then(|d| NaiveDate::from_ymd_opt(start_day.year(), start_day.month(), d))
                .unwrap_or_else(|| end_of_month.date());
            let end_of_week = end_of_week_date.and_hms_opt(23, 59, 59).unwrap();

            out.extend(self.latest_in(start_day, end_of_week));
            start_day += TimeDelta::days(7);
        }
        out
    }

    /// Indices of the latest item per month, for the year before `end`.
    pub fn one_per_month_last_year(&self) -> Vec<usize> {
        let last_year = midnight(self.end - TimeDelta::days(365));
        let mut out = Vec::new();
        let mut timestamp = last_year;
        while timestamp <= self.end {
            let start_of_month = timestamp.with_day(1).unwrap();
            let end_of_month = last_day_of_month(start_of_month);
            out.extend(self.latest_in(start_of_month, end_of_month));
            timestamp = end_of_month + TimeDelta::seconds(1);
        }
        out
    }

    /// Indices of the latest item per calendar year, across all items.
    pub fn one_per_year(&self) -> Vec<usize> {
        let mut by_recency: Vec<usize> = (0..self.items.len()).collect();
        by_recency.sort_by_key(|&i| std::cmp::Reverse((self.key)(&self.items[i])));

        let mut seen_years = HashSet::new();
        let mut out = Vec::new();
        for i in by_recency {
            if seen_years.insert((self.key)(&self.items[i]).year()) {
                out.push(i);
            }
        }
        out
    }

    /// Indices of items strictly before `start`, or none if `start` is unset.
    pub fn past(&self) -> Vec<usize> {
        let Some(start) = self.start else {
            return Vec::new();
        };
        (0..self.items.len())
            .filter(|&i| (self.key)(&self.items[i]) < start)
            .collect()
    }

    /// The last day of `timestamp`'s month, at 23:59:59.
    pub fn last_day_of_month(&self, timestamp: NaiveDateTime) -> NaiveDateTime {
        last_day_of_month(timestamp)
    }

    fn latest_in(&self, start: NaiveDateTime, end: NaiveDateTime) -> Option<usize> {
        self.filter_range(start, end)
            .into_iter()
            .max_by_key(|&i| (self.key)(&self.items[i]))
    }
}

fn midnight(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_hms_opt(0, 0, 0).unwrap()
}

fn end_of_day(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_hms_opt(23, 59, 59).unwrap()
}

fn first_of_month(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_day(1).unwrap()
}

fn last_day_of_month(dt: NaiveDateTime) -> NaiveDateTime {
    let first_of_this_month = dt.with_day(1).unwrap();
    let first_of_next_month = first_of_this_month
        .checked_add_months(Months::new(1))
        .unwrap();
    (first_of_next_month - TimeDelta::days(1))
        .date()
        .and_hms_opt(23, 59, 59)
        .unwrap()
}
