//! Lenient mapping from upstream JSON records into domain types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use perfdash_core::{Lead, Prospection, ProspectionStatus, ResponsibleUser};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Accepts strings and numbers; everything else reads as absent.
fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(text_of))
}

fn text_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawResponsible {
    #[serde(deserialize_with = "de_opt_text")]
    id: Option<String>,
    #[serde(deserialize_with = "de_opt_text")]
    first_name: Option<String>,
    #[serde(deserialize_with = "de_opt_text")]
    last_name: Option<String>,
    #[serde(deserialize_with = "de_opt_text")]
    email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawProspection {
    #[serde(deserialize_with = "de_opt_text")]
    id: Option<String>,
    responsible: Option<JsonValue>,
    #[serde(deserialize_with = "de_opt_text")]
    status: Option<String>,
    meeting: Option<JsonValue>,
    #[serde(deserialize_with = "de_opt_text")]
    lost_reason: Option<String>,
    #[serde(deserialize_with = "de_opt_text")]
    start_date: Option<String>,
    #[serde(deserialize_with = "de_opt_text")]
    end_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawLead {
    #[serde(deserialize_with = "de_opt_text")]
    id: Option<String>,
    responsible: Option<JsonValue>,
}

/// Parsed items plus how many inputs could not be read at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub items: Vec<T>,
    pub malformed: usize,
}

/// JavaScript-style truthiness, which is how the upstream flags presence fields.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// RFC 3339, naive date-times (as UTC), bare dates, or epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
    }
    None
}

fn responsible_from(value: Option<JsonValue>) -> Option<ResponsibleUser> {
    match value? {
        JsonValue::Object(map) => {
            let raw: RawResponsible =
                serde_json::from_value(JsonValue::Object(map)).unwrap_or_default();
            let user = ResponsibleUser {
                id: raw.id,
                first_name: raw.first_name,
                last_name: raw.last_name,
                email: raw.email,
            };
            (user != ResponsibleUser::default()).then_some(user)
        }
        other => text_of(&other).map(|id| ResponsibleUser {
            id: Some(id),
            ..Default::default()
        }),
    }
}

pub fn parse_prospections(values: Vec<JsonValue>) -> Parsed<Prospection> {
    let mut items = Vec::with_capacity(values.len());
    let mut malformed = 0usize;
    for value in values {
        let raw: RawProspection = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(error = %err, "skipping unreadable prospection");
                malformed += 1;
                continue;
            }
        };
        items.push(Prospection {
            id: raw.id,
            responsible: responsible_from(raw.responsible),
            status: ProspectionStatus::parse(raw.status.as_deref().unwrap_or_default()),
            has_meeting: raw.meeting.as_ref().map(is_truthy).unwrap_or(false),
            lost_reason: raw.lost_reason,
            started_at: raw.start_date.as_deref().and_then(parse_timestamp),
            ended_at: raw.end_date.as_deref().and_then(parse_timestamp),
        });
    }
    Parsed { items, malformed }
}

pub fn parse_leads(values: Vec<JsonValue>) -> Parsed<Lead> {
    let mut items = Vec::with_capacity(values.len());
    let mut malformed = 0usize;
    for value in values {
        let raw: RawLead = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(error = %err, "skipping unreadable lead");
                malformed += 1;
                continue;
            }
        };
        items.push(Lead {
            id: raw.id,
            responsible: responsible_from(raw.responsible),
        });
    }
    Parsed { items, malformed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prospection_fields_map_with_fallbacks() {
        let parsed = parse_prospections(vec![
            json!({
                "id": 42,
                "responsible": {
                    "id": "u-1",
                    "firstName": "Ana",
                    "lastName": "Lima",
                    "email": "ana@x.io"
                },
                "status": "won",
                "meeting": {"id": "m-1"},
                "startDate": "2026-03-01T10:00:00Z",
                "endDate": "2026-03-01T15:00:00Z"
            }),
            json!({ "status": "LOST", "lostReason": "Cliente ausente", "meeting": null }),
            json!("not an object"),
        ]);

        assert_eq!(parsed.malformed, 1);
        assert_eq!(parsed.items.len(), 2);

        let won = &parsed.items[0];
        assert_eq!(won.id.as_deref(), Some("42"));
        assert_eq!(won.status, ProspectionStatus::Won);
        assert!(won.has_meeting);
        assert_eq!(won.duration_hours(), Some(5.0));
        assert_eq!(
            won.responsible.as_ref().and_then(|r| r.id.as_deref()),
            Some("u-1")
        );

        let lost = &parsed.items[1];
        assert!(lost.responsible.is_none());
        assert!(!lost.has_meeting);
        assert_eq!(lost.lost_reason.as_deref(), Some("Cliente ausente"));
    }

    #[test]
    fn empty_responsible_objects_are_treated_as_missing() {
        let parsed = parse_leads(vec![
            json!({ "id": "l1", "responsible": {} }),
            json!({ "id": "l2", "responsible": "u-9" }),
            json!({ "id": "l3" }),
        ]);
        assert!(parsed.items[0].responsible.is_none());
        assert_eq!(
            parsed.items[1].responsible.as_ref().and_then(|r| r.id.as_deref()),
            Some("u-9")
        );
        assert!(parsed.items[2].responsible.is_none());
    }

    #[test]
    fn timestamps_accept_common_shapes() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-03-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T07:00:00-03:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01 10:00:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2026-03-01"),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp(&expected.timestamp_millis().to_string()), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn truthiness_matches_presence_semantics() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!("2026-03-01")));
        assert!(is_truthy(&json!(1)));
    }
}
