//! Class schedule and attendance session model

use crate::domain::types::CardId;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One scheduled class in the device's room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    #[serde(alias = "id")]
    pub class_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(deserialize_with = "deserialize_time_of_day", serialize_with = "serialize_time_of_day")]
    pub start_time: NaiveTime,
    #[serde(deserialize_with = "deserialize_time_of_day", serialize_with = "serialize_time_of_day")]
    pub end_time: NaiveTime,
    #[serde(default)]
    pub professor_id: Option<String>,
}

impl ClassInfo {
    /// Session bounds for this class on the given day
    pub fn bounds_on(&self, day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        (day.and_time(self.start_time), day.and_time(self.end_time))
    }
}

/// Parse "HH:MM" or "HH:MM:SS"
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn deserialize_time_of_day<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimeOfDayVisitor;

    impl<'de> Visitor<'de> for TimeOfDayVisitor {
        type Value = NaiveTime;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a time of day formatted HH:MM or HH:MM:SS")
        }

        fn visit_str<E>(self, value: &str) -> Result<NaiveTime, E>
        where
            E: de::Error,
        {
            parse_time_of_day(value)
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(TimeOfDayVisitor)
}

fn serialize_time_of_day<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&time.format("%H:%M").to_string())
}

/// Resolve the class in progress (or next up) at `now`
///
/// Classes are ordered by end time; the first one whose end is still in the
/// future wins. Returns None once every class of the day has ended.
pub fn current_class(schedule: &[ClassInfo], now: NaiveTime) -> Option<&ClassInfo> {
    let mut by_end: Vec<&ClassInfo> = schedule.iter().collect();
    by_end.sort_by_key(|c| c.end_time);
    by_end.into_iter().find(|c| c.end_time > now)
}

/// Backend-tracked attendance window for one class period
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub class_id: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    /// studentId -> attendance record id
    pub records: FxHashMap<CardId, String>,
}

impl Session {
    pub fn record_for(&self, student: &CardId) -> Option<&str> {
        self.records.get(student).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(id: &str, start: &str, end: &str) -> ClassInfo {
        ClassInfo {
            class_id: id.to_string(),
            name: None,
            start_time: parse_time_of_day(start).unwrap(),
            end_time: parse_time_of_day(end).unwrap(),
            professor_id: None,
        }
    }

    fn at(hhmm: &str) -> NaiveTime {
        parse_time_of_day(hhmm).unwrap()
    }

    #[test]
    fn test_current_class_picks_first_unfinished() {
        let schedule = vec![class("a", "09:00", "10:00"), class("b", "10:30", "11:30")];
        let current = current_class(&schedule, at("10:15")).unwrap();
        assert_eq!(current.class_id, "b");
        assert_eq!(current.end_time, at("11:30"));
    }

    #[test]
    fn test_current_class_none_after_last_class() {
        let schedule = vec![class("a", "09:00", "10:00"), class("b", "10:30", "11:30")];
        assert!(current_class(&schedule, at("12:00")).is_none());
    }

    #[test]
    fn test_current_class_unsorted_input() {
        let schedule = vec![class("late", "13:00", "14:00"), class("early", "08:00", "09:00")];
        assert_eq!(current_class(&schedule, at("07:30")).unwrap().class_id, "early");
        assert_eq!(current_class(&schedule, at("09:30")).unwrap().class_id, "late");
    }

    #[test]
    fn test_current_class_empty_schedule() {
        assert!(current_class(&[], at("10:00")).is_none());
    }

    #[test]
    fn test_class_info_deserialize() {
        let json = r#"[
            {"id": "c1", "name": "Databases", "startTime": "09:00", "endTime": "10:00:00"},
            {"classId": "c2", "startTime": "10:30", "endTime": "11:30", "professorId": "p7"}
        ]"#;
        let classes: Vec<ClassInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(classes[0].class_id, "c1");
        assert_eq!(classes[0].end_time, at("10:00"));
        assert_eq!(classes[1].professor_id.as_deref(), Some("p7"));
    }

    #[test]
    fn test_class_info_rejects_bad_time() {
        let json = r#"{"id": "c1", "startTime": "nine", "endTime": "10:00"}"#;
        assert!(serde_json::from_str::<ClassInfo>(json).is_err());
    }

    #[test]
    fn test_bounds_on_day() {
        let c = class("a", "09:00", "10:00");
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let (start, end) = c.bounds_on(day);
        assert_eq!(start.to_string(), "2026-10-19 09:00:00");
        assert_eq!(end.to_string(), "2026-10-19 10:00:00");
    }
}
