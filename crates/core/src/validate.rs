//! Validation of untrusted, LLM-produced metadata.
//!
//! Everything the model hands back goes through [`validate_metadata`] before
//! it can reach the store. The checks are structural (enums, ranges, list
//! shapes); free-form keys pass through untouched. Timestamps get their own
//! validator because callers need the normalized form, not just a verdict.

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Importance, MemoryKind, MemoryType, RelationshipType, SourceKind, Stability};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid metadata field `{field}`: {reason}")]
pub struct ValidateError {
    pub field: String,
    pub reason: String,
}

impl ValidateError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

/// Outcome of timestamp validation. `normalized` is RFC 3339 UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampCheck {
    pub valid: bool,
    pub normalized: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

/// Validate a full or partial ISO-8601 timestamp. Date-only input is accepted
/// and normalized to midnight UTC. Future timestamps are valid but flagged.
pub fn validate_timestamp(raw: &str) -> TimestampCheck {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return TimestampCheck {
            valid: false,
            error: Some("timestamp is empty".to_string()),
            ..Default::default()
        };
    }

    let parsed: Option<DateTime<Utc>> = DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        });

    match parsed {
        Some(instant) => {
            let warning = if instant > Utc::now() {
                Some("timestamp is in the future".to_string())
            } else {
                None
            };
            TimestampCheck {
                valid: true,
                normalized: Some(instant.to_rfc3339_opts(SecondsFormat::Secs, true)),
                error: None,
                warning,
            }
        }
        None => TimestampCheck {
            valid: false,
            error: Some(format!(
                "`{trimmed}` is not an ISO-8601 timestamp or YYYY-MM-DD date"
            )),
            ..Default::default()
        },
    }
}

/// Validate a candidate metadata object. Unknown keys are allowed; known
/// keys must have the right shape. Returns the first violation found.
pub fn validate_metadata(metadata: &Value) -> Result<(), ValidateError> {
    let map = match metadata {
        Value::Null => return Ok(()),
        Value::Object(map) => map,
        other => {
            return Err(ValidateError::new(
                "metadata",
                format!("expected an object, got {}", type_name(other)),
            ))
        }
    };

    if let Some(value) = get_either(map, "memoryType", "memory_type") {
        check_enum(value, "memoryType", |s| MemoryType::parse(s).is_some(), "self|belief|pattern|episodic|semantic")?;
    }
    if let Some(value) = map.get("importance") {
        check_enum(value, "importance", |s| Importance::parse(s).is_some(), "low|medium|high")?;
    }
    if let Some(value) = map.get("source") {
        check_enum(value, "source", |s| SourceKind::parse(s).is_some(), "user|file|system")?;
    }
    if let Some(value) = map.get("kind") {
        check_enum(value, "kind", |s| MemoryKind::parse(s).is_some(), "raw|summary|derived")?;
    }
    if let Some(value) = map.get("stability") {
        check_enum(value, "stability", |s| Stability::parse(s).is_some(), "tentative|stable|canonical")?;
    }

    if let Some(dynamics) = map.get("dynamics") {
        validate_dynamics(dynamics)?;
    }
    if let Some(relationships) = map.get("relationships") {
        validate_relationships(relationships)?;
    }
    if let Some(emotion) = map.get("emotion") {
        validate_emotion(emotion)?;
    }

    for key in ["tags", "relatedIds", "related_ids", "derivedFromIds", "derived_from_ids"] {
        if let Some(value) = map.get(key) {
            check_string_list(value, key)?;
        }
    }

    if let Some(value) = map.get("date") {
        validate_date(value)?;
    }

    Ok(())
}

fn validate_dynamics(dynamics: &Value) -> Result<(), ValidateError> {
    let map = dynamics.as_object().ok_or_else(|| {
        ValidateError::new("dynamics", format!("expected an object, got {}", type_name(dynamics)))
    })?;

    for key in ["initialPriority", "initial_priority", "currentPriority", "current_priority"] {
        if let Some(value) = map.get(key) {
            let number = value.as_f64().ok_or_else(|| {
                ValidateError::new(format!("dynamics.{key}"), "must be a number")
            })?;
            if !(0.0..=1.0).contains(&number) {
                return Err(ValidateError::new(
                    format!("dynamics.{key}"),
                    format!("{number} is outside [0, 1]"),
                ));
            }
        }
    }

    for key in ["accessCount", "access_count", "maxAccessCount", "max_access_count"] {
        if let Some(value) = map.get(key) {
            let count = value.as_i64().ok_or_else(|| {
                ValidateError::new(format!("dynamics.{key}"), "must be an integer")
            })?;
            if count < 0 {
                return Err(ValidateError::new(
                    format!("dynamics.{key}"),
                    format!("{count} is negative"),
                ));
            }
        }
    }

    for key in ["createdAt", "created_at", "lastAccessedAt", "last_accessed_at"] {
        if let Some(value) = map.get(key) {
            let raw = value.as_str().ok_or_else(|| {
                ValidateError::new(format!("dynamics.{key}"), "must be a string timestamp")
            })?;
            let check = validate_timestamp(raw);
            if !check.valid {
                return Err(ValidateError::new(
                    format!("dynamics.{key}"),
                    check.error.unwrap_or_else(|| "unparseable timestamp".to_string()),
                ));
            }
        }
    }

    if let Some(value) = map.get("stability") {
        check_enum(value, "dynamics.stability", |s| Stability::parse(s).is_some(), "tentative|stable|canonical")?;
    }

    Ok(())
}

fn validate_relationships(relationships: &Value) -> Result<(), ValidateError> {
    let list = relationships.as_array().ok_or_else(|| {
        ValidateError::new("relationships", format!("expected a list, got {}", type_name(relationships)))
    })?;

    for (position, element) in list.iter().enumerate() {
        let field = format!("relationships[{position}]");
        let map = element
            .as_object()
            .ok_or_else(|| ValidateError::new(&field, "expected an object"))?;

        let target = get_either(map, "targetId", "target_id")
            .ok_or_else(|| ValidateError::new(format!("{field}.targetId"), "is required"))?;
        if !target.is_string() || target.as_str().is_some_and(|s| s.trim().is_empty()) {
            return Err(ValidateError::new(
                format!("{field}.targetId"),
                "must be a non-empty string",
            ));
        }

        if let Some(value) = map.get("type") {
            check_enum(
                value,
                format!("{field}.type"),
                |s| RelationshipType::parse(s).is_some(),
                "a known relationship type",
            )?;
        } else {
            return Err(ValidateError::new(format!("{field}.type"), "is required"));
        }

        if let Some(value) = map.get("weight") {
            let weight = value
                .as_f64()
                .ok_or_else(|| ValidateError::new(format!("{field}.weight"), "must be a number"))?;
            if !(0.0..=1.0).contains(&weight) {
                return Err(ValidateError::new(
                    format!("{field}.weight"),
                    format!("{weight} is outside [0, 1]"),
                ));
            }
        }
    }

    Ok(())
}

fn validate_emotion(emotion: &Value) -> Result<(), ValidateError> {
    let map = emotion.as_object().ok_or_else(|| {
        ValidateError::new("emotion", format!("expected an object, got {}", type_name(emotion)))
    })?;

    if let Some(label) = map.get("label") {
        if !label.is_string() {
            return Err(ValidateError::new("emotion.label", "must be a string"));
        }
    }
    if let Some(value) = map.get("intensity") {
        let intensity = value
            .as_f64()
            .ok_or_else(|| ValidateError::new("emotion.intensity", "must be a number"))?;
        if !(0.0..=1.0).contains(&intensity) {
            return Err(ValidateError::new(
                "emotion.intensity",
                format!("{intensity} is outside [0, 1]"),
            ));
        }
    }
    Ok(())
}

fn validate_date(value: &Value) -> Result<(), ValidateError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ValidateError::new("date", "must be a string"))?;

    let mut parts = raw.splitn(3, '-');
    let ymd: Option<(i32, u32, u32)> = (|| {
        let year = parts.next()?.parse().ok()?;
        let month_str = parts.next()?;
        let day_str = parts.next()?;
        if month_str.len() != 2 || day_str.len() != 2 {
            return None;
        }
        Some((year, month_str.parse().ok()?, day_str.parse().ok()?))
    })();

    let calendar_valid = ymd.is_some_and(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).is_some());
    if !calendar_valid {
        return Err(ValidateError::new(
            "date",
            format!("`{raw}` is not a calendar-valid YYYY-MM-DD date"),
        ));
    }
    Ok(())
}

fn check_enum(
    value: &Value,
    field: impl Into<String>,
    accepts: impl Fn(&str) -> bool,
    expected: &str,
) -> Result<(), ValidateError> {
    let field = field.into();
    let raw = value
        .as_str()
        .ok_or_else(|| ValidateError::new(field.clone(), "must be a string"))?;
    if accepts(raw) {
        Ok(())
    } else {
        Err(ValidateError::new(field, format!("`{raw}` is not one of {expected}")))
    }
}

fn check_string_list(value: &Value, field: &str) -> Result<(), ValidateError> {
    let list = value
        .as_array()
        .ok_or_else(|| ValidateError::new(field, "must be a list of strings"))?;
    if list.iter().any(|element| !element.is_string()) {
        return Err(ValidateError::new(field, "every element must be a string"));
    }
    Ok(())
}

fn get_either<'a>(
    map: &'a serde_json::Map<String, Value>,
    camel: &str,
    snake: &str,
) -> Option<&'a Value> {
    map.get(camel).or_else(|| map.get(snake))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_and_null_metadata_pass() {
        assert!(validate_metadata(&Value::Null).is_ok());
        assert!(validate_metadata(&json!({})).is_ok());
    }

    #[test]
    fn unknown_keys_pass_through() {
        let meta = json!({"projectPhase": "alpha", "custom": [1, 2, 3]});
        assert!(validate_metadata(&meta).is_ok());
    }

    #[test]
    fn rejects_out_of_enum_values() {
        for meta in [
            json!({"memoryType": "procedural"}),
            json!({"importance": "critical"}),
            json!({"source": "api"}),
            json!({"kind": "condensed"}),
            json!({"stability": "frozen"}),
        ] {
            assert!(validate_metadata(&meta).is_err(), "{meta}");
        }
    }

    #[test]
    fn rejects_priority_outside_unit_interval() {
        let meta = json!({"dynamics": {"initialPriority": 1.5}});
        let err = validate_metadata(&meta).unwrap_err();
        assert_eq!(err.field, "dynamics.initialPriority");

        let meta = json!({"dynamics": {"currentPriority": "high"}});
        assert!(validate_metadata(&meta).is_err());
    }

    #[test]
    fn rejects_bad_access_counts() {
        assert!(validate_metadata(&json!({"dynamics": {"accessCount": -1}})).is_err());
        assert!(validate_metadata(&json!({"dynamics": {"accessCount": 1.5}})).is_err());
        assert!(validate_metadata(&json!({"dynamics": {"accessCount": 3}})).is_ok());
    }

    #[test]
    fn rejects_unparseable_dynamics_timestamps() {
        assert!(validate_metadata(&json!({"dynamics": {"createdAt": "yesterday"}})).is_err());
        assert!(
            validate_metadata(&json!({"dynamics": {"createdAt": "2024-06-01T10:00:00Z"}})).is_ok()
        );
    }

    #[test]
    fn relationships_must_be_a_well_formed_list() {
        assert!(validate_metadata(&json!({"relationships": "none"})).is_err());
        assert!(validate_metadata(&json!({"relationships": [{"type": "supports"}]})).is_err());
        assert!(validate_metadata(
            &json!({"relationships": [{"targetId": "mem_1", "type": "refutes"}]})
        )
        .is_err());
        assert!(validate_metadata(
            &json!({"relationships": [{"targetId": "mem_1", "type": "supports", "weight": 2.0}]})
        )
        .is_err());
        assert!(validate_metadata(
            &json!({"relationships": [{"targetId": "mem_1", "type": "supports", "weight": 0.9}]})
        )
        .is_ok());
        // Empty list is valid — it means "clear all edges".
        assert!(validate_metadata(&json!({"relationships": []})).is_ok());
    }

    #[test]
    fn emotion_shape_is_checked() {
        assert!(validate_metadata(&json!({"emotion": {"label": 3}})).is_err());
        assert!(validate_metadata(&json!({"emotion": {"intensity": 1.2}})).is_err());
        assert!(
            validate_metadata(&json!({"emotion": {"label": "joy", "intensity": 0.7}})).is_ok()
        );
    }

    #[test]
    fn id_lists_must_hold_strings() {
        assert!(validate_metadata(&json!({"tags": ["a", 1]})).is_err());
        assert!(validate_metadata(&json!({"relatedIds": "mem_1"})).is_err());
        assert!(validate_metadata(&json!({"derivedFromIds": ["mem_1", "mem_2"]})).is_ok());
    }

    #[test]
    fn date_must_be_calendar_valid() {
        assert!(validate_metadata(&json!({"date": "2024-04-31"})).is_err());
        assert!(validate_metadata(&json!({"date": "2024-02-31"})).is_err());
        assert!(validate_metadata(&json!({"date": "2024-2-3"})).is_err());
        assert!(validate_metadata(&json!({"date": "2024-02-29"})).is_ok());
        assert!(validate_metadata(&json!({"date": "2023-02-28"})).is_ok());
    }

    #[test]
    fn timestamp_accepts_date_only_and_normalizes() {
        let check = validate_timestamp("2024-06-15");
        assert!(check.valid);
        assert_eq!(check.normalized.as_deref(), Some("2024-06-15T00:00:00Z"));
    }

    #[test]
    fn timestamp_normalizes_offsets_to_utc() {
        let check = validate_timestamp("2024-06-15T12:30:00+02:00");
        assert!(check.valid);
        assert_eq!(check.normalized.as_deref(), Some("2024-06-15T10:30:00Z"));
    }

    #[test]
    fn timestamp_rejects_garbage() {
        let check = validate_timestamp("not a time");
        assert!(!check.valid);
        assert!(check.error.is_some());
        assert!(check.normalized.is_none());
    }

    #[test]
    fn future_timestamp_is_valid_with_warning() {
        let future = (Utc::now() + chrono::Duration::days(30)).to_rfc3339();
        let check = validate_timestamp(&future);
        assert!(check.valid);
        assert!(check.warning.is_some());
    }
}
