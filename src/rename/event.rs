use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published once per committed username change.
///
/// Wire format is camelCase JSON with an RFC 3339 timestamp:
/// `{"subjectId", "oldDisplayName", "newDisplayName", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameEvent {
    pub subject_id: String,
    /// Informational; never used to decide what to update.
    pub old_display_name: String,
    pub new_display_name: String,
    pub timestamp: DateTime<Utc>,
}

impl RenameEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Ordering key used by the stale-event guard.
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_format() {
        let event = RenameEvent {
            subject_id: "u1".into(),
            old_display_name: "old".into(),
            new_display_name: "new".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };

        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["subjectId"], "u1");
        assert_eq!(json["oldDisplayName"], "old");
        assert_eq!(json["newDisplayName"], "new");
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_parses_offset_timestamps() {
        let event = RenameEvent::from_json(
            r#"{"subjectId":"u1","oldDisplayName":"a","newDisplayName":"b","timestamp":"2024-05-01T14:00:00+02:00"}"#,
        )
        .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rejects_missing_fields() {
        assert!(RenameEvent::from_json(r#"{"subjectId":"u1"}"#).is_err());
        assert!(RenameEvent::from_json("not json").is_err());
    }
}
