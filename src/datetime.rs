use chrono::{DateTime, FixedOffset, MappedLocalTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta, Utc};
use rocket::serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct StudioDateTime(pub DateTime<FixedOffset>);
impl StudioDateTime {
    pub fn now() -> Self {
        Self::from_fixed_offset(chrono::Local::now().fixed_offset())
    }
    pub fn from_fixed_offset(datetime: DateTime<FixedOffset>) -> StudioDateTime {
        let millis = datetime.timestamp_subsec_millis();
        let nanos = datetime.timestamp_subsec_nanos() - millis * 1_000_000;
        if let Some(dt) = datetime.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64)) {
            StudioDateTime(dt)
        } else {
            StudioDateTime(datetime)
        }
    }
    pub fn trimmed_to_sec(&self) -> Self {
        let nanos = self.0.timestamp_subsec_nanos();
        if let Some(dt) = self.0.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64)) {
            StudioDateTime(dt)
        } else {
            *self
        }
    }
    pub fn from_local_timezone(local_dt: NaiveDateTime, offset: &FixedOffset) -> Option<StudioDateTime> {
        match local_dt.and_local_timezone(*offset) {
            MappedLocalTime::Single(dt) => Some(StudioDateTime(dt)),
            MappedLocalTime::Ambiguous(_, _) => None,
            MappedLocalTime::None => None,
        }
    }
    /// Start of a class given as local date and wall clock time of the studio.
    pub fn from_class_slot(date: NaiveDate, time: NaiveTime, offset: &FixedOffset) -> Option<StudioDateTime> {
        Self::from_local_timezone(NaiveDateTime::new(date, time), offset)
    }
    pub fn checked_add_days(&self, days: i64) -> Option<Self> {
        self.0.checked_add_signed(TimeDelta::days(days)).map(StudioDateTime)
    }
    /// Signed fractional hours from `self` until `later`, negative when `later` is in the past.
    pub fn hours_until(&self, later: &StudioDateTime) -> f64 {
        later.0.signed_duration_since(self.0).num_milliseconds() as f64 / 3_600_000.
    }
    pub fn to_display_string(self) -> String {
        self.0.format("%F %T").to_string()
    }
    pub fn to_iso_string(self) -> String {
        if self.0.timestamp_subsec_millis() == 0 {
            self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
        } else {
            self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
        }
    }
    pub fn from_iso_string(datetime_str: &str) -> Result<Self, anyhow::Error> {
        let dt = DateTime::parse_from_rfc3339(datetime_str)?;
        Ok(Self::from_fixed_offset(dt))
    }
    // stored as UTC with fixed precision, so TEXT columns sort chronologically
    fn to_db_string(self) -> String {
        self.0.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl From<DateTime<FixedOffset>> for StudioDateTime {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Self::from_fixed_offset(value)
    }
}
impl<DB: sqlx::Database> sqlx::Type<DB> for StudioDateTime
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for StudioDateTime
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(StudioDateTime::from_iso_string(value)?)
    }
}
impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for StudioDateTime {
    fn encode_by_ref(&self, buf: &mut <sqlx::Sqlite as sqlx::Database>::ArgumentBuffer<'q>) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.to_db_string(), buf)
    }
}

pub(crate) fn dtstr(iso_date_str: Option<&str>) -> String {
    let Some(s) = iso_date_str else {
        return "---".to_string()
    };
    if let Ok(dt) = StudioDateTime::from_iso_string(s) {
        dt.to_display_string()
    } else {
        s.to_string()
    }
}
pub(crate) fn hhmm(time_str: Option<&str>) -> String {
    let Some(s) = time_str else {
        return "--:--".to_string()
    };
    s.get(..5).unwrap_or(s).to_string()
}

#[test]
fn test_trimmed_to_sec() {
    let dt = StudioDateTime::now().trimmed_to_sec();
    assert_eq!(dt.0.timestamp_subsec_nanos(), 0);
}

#[test]
fn test_from_class_slot() {
    let offset = FixedOffset::east_opt(3600).unwrap();
    let date = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
    let time = NaiveTime::from_hms_opt(18, 30, 0).unwrap();
    let dt = StudioDateTime::from_class_slot(date, time, &offset).unwrap();
    assert_eq!(dt.to_iso_string(), "2026-03-05T18:30:00+01:00");
}

#[test]
fn test_hours_until() {
    let now = StudioDateTime::from_iso_string("2026-03-05T10:00:00Z").unwrap();
    let later = StudioDateTime::from_iso_string("2026-03-06T16:00:00+01:00").unwrap();
    assert_eq!(now.hours_until(&later), 29.);
    assert_eq!(later.hours_until(&now), -29.);
}

#[test]
fn test_db_string_is_utc() {
    let dt = StudioDateTime::from_iso_string("2026-03-05T14:32:45+10:00").unwrap();
    assert_eq!(dt.to_db_string(), "2026-03-05T04:32:45.000Z");
}

#[test]
fn test_parse_studio_datetime() {
    for (dtstr, dtstr2) in &[
        ("1970-03-05 14:32:45+00:00", "1970-03-05T14:32:45Z"),
        ("2025-03-05T14:32:45Z", "2025-03-05T14:32:45Z"),
        ("2025-03-05 14:32:45+10:00", "2025-03-05T14:32:45+10:00"),
        ("2025-03-17T20:45:38.565293063+01:00", "2025-03-17T20:45:38.565+01:00"),
    ] {
        let dt = StudioDateTime::from_iso_string(dtstr)
            .map_err(|e| println!("parse {dtstr} error: {e}")).unwrap();
        assert_eq!(&dt.to_iso_string(), dtstr2)
    }
}

#[test]
fn test_hhmm() {
    assert_eq!(hhmm(Some("18:30:00")), "18:30");
    assert_eq!(hhmm(None), "--:--");
}
