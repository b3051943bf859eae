use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Temporal resolution of a cohort bucket, chosen from the TTL length per §3:
/// `<3600s -> minute, <86400s -> hour, <2592000s -> day, else -> week`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
}

impl Granularity {
    pub fn from_ttl_seconds(ttl_seconds: u64) -> Self {
        match ttl_seconds {
            s if s < 3_600 => Granularity::Minute,
            s if s < 86_400 => Granularity::Hour,
            s if s < 2_592_000 => Granularity::Day,
            _ => Granularity::Week,
        }
    }

    /// Cohort string for `at`: minute `YYYY-MM-DDTHH:MM`, hour `YYYY-MM-DDTHH`,
    /// day `YYYY-MM-DD`, week `YYYY-Wnn` (ISO 8601 week).
    pub fn cohort(&self, at: DateTime<Utc>) -> String {
        match self {
            Granularity::Minute => at.format("%Y-%m-%dT%H:%M").to_string(),
            Granularity::Hour => at.format("%Y-%m-%dT%H").to_string(),
            Granularity::Day => at.format("%Y-%m-%d").to_string(),
            Granularity::Week => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }

    fn bucket_span(&self) -> Duration {
        match self {
            Granularity::Minute => Duration::minutes(1),
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
            Granularity::Week => Duration::weeks(1),
        }
    }

    /// The last `k` cohort strings ending at (and including) `now`'s bucket,
    /// oldest first. K=3 for minute, 2 for hour/day/week per §4.4.
    pub fn recent_cohorts(&self, now: DateTime<Utc>, k: u32) -> Vec<String> {
        let span = self.bucket_span();
        (0..k).rev().map(|offset| self.cohort(now - span * (offset as i32))).collect()
    }

    pub fn default_lookback(&self) -> u32 {
        match self {
            Granularity::Minute => 3,
            _ => 2,
        }
    }

    /// Cron expression driving this granularity's sweep cadence: minute every
    /// ~10s, hour every ~10min, day hourly, week daily.
    pub fn sweep_cron(&self) -> &'static str {
        match self {
            Granularity::Minute => "*/10 * * * * *",
            Granularity::Hour => "*/10 * * * *",
            Granularity::Day => "0 * * * *",
            Granularity::Week => "0 0 * * *",
        }
    }
}

/// Deterministic id for the expiration index: `<resourceName>:<recordId>`.
pub fn entity_id(resource_name: &str, record_id: &str) -> String {
    format!("{resource_name}:{record_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlIndexEntry {
    pub resource_name: String,
    pub record_id: String,
    pub expires_at_cohort: String,
    pub expires_at_timestamp: i64,
    pub granularity: Granularity,
    pub created_at: DateTime<Utc>,
}

impl TtlIndexEntry {
    pub fn new(resource_name: impl Into<String>, record_id: impl Into<String>, expires_at: DateTime<Utc>, granularity: Granularity) -> Self {
        Self {
            resource_name: resource_name.into(),
            record_id: record_id.into(),
            expires_at_cohort: granularity.cohort(expires_at),
            expires_at_timestamp: expires_at.timestamp_millis(),
            granularity,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn granularity_boundaries_match_spec() {
        assert_eq!(Granularity::from_ttl_seconds(3_599), Granularity::Minute);
        assert_eq!(Granularity::from_ttl_seconds(3_600), Granularity::Hour);
        assert_eq!(Granularity::from_ttl_seconds(86_399), Granularity::Hour);
        assert_eq!(Granularity::from_ttl_seconds(86_400), Granularity::Day);
        assert_eq!(Granularity::from_ttl_seconds(2_591_999), Granularity::Day);
        assert_eq!(Granularity::from_ttl_seconds(2_592_000), Granularity::Week);
    }

    #[test]
    fn cohort_formats_per_granularity() {
        let at = Utc.with_ymd_and_hms(2026, 7, 27, 14, 5, 0).unwrap();
        assert_eq!(Granularity::Minute.cohort(at), "2026-07-27T14:05");
        assert_eq!(Granularity::Hour.cohort(at), "2026-07-27T14");
        assert_eq!(Granularity::Day.cohort(at), "2026-07-27");
        assert!(Granularity::Week.cohort(at).starts_with("2026-W"));
    }

    #[test]
    fn recent_cohorts_are_oldest_first_and_include_now() {
        let at = Utc.with_ymd_and_hms(2026, 7, 27, 14, 5, 0).unwrap();
        let cohorts = Granularity::Hour.recent_cohorts(at, 2);
        assert_eq!(cohorts, vec!["2026-07-27T13".to_string(), "2026-07-27T14".to_string()]);
    }

    #[test]
    fn entity_id_is_deterministic() {
        assert_eq!(entity_id("sessions", "s1"), "sessions:s1");
    }
}
