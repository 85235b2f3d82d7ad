//! Event types for StudyTrail interaction telemetry.
//!
//! This module defines the event schema shared by the buffer, the dispatcher
//! and the transports. All types serialize to camelCase JSON, with
//! interaction tags as snake_case strings.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Kind of user interaction being recorded.
///
/// Known interactions map to fixed snake_case tags. Any other tag is kept
/// verbatim in [`InteractionType::Custom`] so callers can record ad hoc
/// interactions without extending this enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InteractionType {
    PageView,
    ButtonClick,
    ResourceAccess,
    VideoProgress,
    QuizStart,
    QuizComplete,
    AssessmentStart,
    AssessmentComplete,
    HintRequest,
    FeedbackSubmit,
    ReflectionSubmit,
    BadgeEarned,
    StreakAchieved,
    TopicComplete,
    ErrorOccurred,
    PageBlur,
    PageFocus,
    Custom(String),
}

impl InteractionType {
    /// Returns the wire tag for this interaction.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PageView => "page_view",
            Self::ButtonClick => "button_click",
            Self::ResourceAccess => "resource_access",
            Self::VideoProgress => "video_progress",
            Self::QuizStart => "quiz_start",
            Self::QuizComplete => "quiz_complete",
            Self::AssessmentStart => "assessment_start",
            Self::AssessmentComplete => "assessment_complete",
            Self::HintRequest => "hint_request",
            Self::FeedbackSubmit => "feedback_submit",
            Self::ReflectionSubmit => "reflection_submit",
            Self::BadgeEarned => "badge_earned",
            Self::StreakAchieved => "streak_achieved",
            Self::TopicComplete => "topic_complete",
            Self::ErrorOccurred => "error_occurred",
            Self::PageBlur => "page_blur",
            Self::PageFocus => "page_focus",
            Self::Custom(tag) => tag,
        }
    }

    /// Returns `true` for high-value interactions that are flushed immediately
    /// instead of waiting for the next timer tick.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::AssessmentComplete
                | Self::QuizComplete
                | Self::BadgeEarned
                | Self::ErrorOccurred
                | Self::FeedbackSubmit
        )
    }
}

impl From<&str> for InteractionType {
    fn from(tag: &str) -> Self {
        match tag {
            "page_view" => Self::PageView,
            "button_click" => Self::ButtonClick,
            "resource_access" => Self::ResourceAccess,
            "video_progress" => Self::VideoProgress,
            "quiz_start" => Self::QuizStart,
            "quiz_complete" => Self::QuizComplete,
            "assessment_start" => Self::AssessmentStart,
            "assessment_complete" => Self::AssessmentComplete,
            "hint_request" => Self::HintRequest,
            "feedback_submit" => Self::FeedbackSubmit,
            "reflection_submit" => Self::ReflectionSubmit,
            "badge_earned" => Self::BadgeEarned,
            "streak_achieved" => Self::StreakAchieved,
            "topic_complete" => Self::TopicComplete,
            "error_occurred" => Self::ErrorOccurred,
            "page_blur" => Self::PageBlur,
            "page_focus" => Self::PageFocus,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl FromStr for InteractionType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for InteractionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InteractionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from(tag.as_str()))
    }
}

/// Page visibility as reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Coarse device classification derived from the viewport width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    /// Returns the wire name of this device class.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
        }
    }
}

/// An enriched interaction event.
///
/// Events are immutable once built; only the buffer holding them changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    /// What the user did.
    pub interaction_type: InteractionType,

    /// URL of the page the interaction happened on.
    pub page_url: String,

    /// URL the user arrived from, if known.
    pub referrer_url: Option<String>,

    /// Caller metadata merged with derived device context.
    pub metadata: Map<String, Value>,

    /// Identifier of the page session that produced this event.
    pub session_id: String,

    /// When the event was captured.
    pub timestamp: DateTime<Utc>,
}

impl InteractionEvent {
    /// Reads a metadata field, if present.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> InteractionEvent {
        let mut metadata = Map::new();
        metadata.insert("quizId".to_string(), json!("quiz-1"));

        InteractionEvent {
            interaction_type: InteractionType::QuizComplete,
            page_url: "https://learn.example.com/quiz/1".to_string(),
            referrer_url: None,
            metadata,
            session_id: "1700000000000-abcdefghi".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn known_tags_round_trip_through_from_str() {
        for tag in [
            "page_view",
            "button_click",
            "quiz_complete",
            "error_occurred",
            "page_blur",
            "page_focus",
        ] {
            let parsed: InteractionType = tag.parse().unwrap();
            assert!(!matches!(parsed, InteractionType::Custom(_)), "{tag}");
            assert_eq!(parsed.as_str(), tag);
        }
    }

    #[test]
    fn unknown_tag_is_kept_as_custom() {
        let parsed = InteractionType::from("glossary_lookup");
        assert_eq!(
            parsed,
            InteractionType::Custom("glossary_lookup".to_string())
        );
        assert_eq!(parsed.to_string(), "glossary_lookup");
    }

    #[test]
    fn critical_set_is_exact() {
        let critical = [
            InteractionType::AssessmentComplete,
            InteractionType::QuizComplete,
            InteractionType::BadgeEarned,
            InteractionType::ErrorOccurred,
            InteractionType::FeedbackSubmit,
        ];
        for interaction in &critical {
            assert!(interaction.is_critical(), "{interaction}");
        }

        let routine = [
            InteractionType::PageView,
            InteractionType::ButtonClick,
            InteractionType::QuizStart,
            InteractionType::PageBlur,
            InteractionType::Custom("quiz_complete_v2".to_string()),
        ];
        for interaction in &routine {
            assert!(!interaction.is_critical(), "{interaction}");
        }
    }

    #[test]
    fn interaction_type_serializes_as_plain_string() {
        assert_eq!(
            serde_json::to_string(&InteractionType::HintRequest).unwrap(),
            "\"hint_request\""
        );
        let custom: InteractionType = serde_json::from_str("\"scroll_depth\"").unwrap();
        assert_eq!(custom, InteractionType::Custom("scroll_depth".to_string()));
    }

    #[test]
    fn visibility_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&Visibility::Hidden).unwrap(),
            "\"hidden\""
        );
        assert_eq!(
            serde_json::from_str::<Visibility>("\"visible\"").unwrap(),
            Visibility::Visible
        );
    }

    #[test]
    fn event_serializes_with_camel_case_fields() {
        let json = serde_json::to_value(sample_event()).unwrap();

        assert_eq!(json["interactionType"], "quiz_complete");
        assert_eq!(json["pageUrl"], "https://learn.example.com/quiz/1");
        assert!(json["referrerUrl"].is_null());
        assert_eq!(json["metadata"]["quizId"], "quiz-1");
        assert_eq!(json["sessionId"], "1700000000000-abcdefghi");
        assert_eq!(json["timestamp"], "2024-01-01T00:00:00Z");
        assert!(json.get("interaction_type").is_none());
    }

    #[test]
    fn event_deserializes_from_wire_format() {
        let json = r#"{
            "interactionType": "badge_earned",
            "pageUrl": "/badges",
            "referrerUrl": "/home",
            "metadata": {"badgeId": "b-7"},
            "sessionId": "s-1",
            "timestamp": "2024-06-01T12:30:00Z"
        }"#;

        let event: InteractionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.interaction_type, InteractionType::BadgeEarned);
        assert_eq!(event.referrer_url.as_deref(), Some("/home"));
        assert_eq!(event.metadata_value("badgeId"), Some(&json!("b-7")));
    }
}
