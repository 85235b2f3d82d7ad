//! Named capture helpers.
//!
//! Thin wrappers over [`Telemetry::capture`] that fix the interaction type
//! and the metadata shape for the dashboard's common interactions. Metadata
//! keys are camelCase, matching what the collector expects.

use serde_json::{json, Value};

use crate::telemetry::Telemetry;
use crate::types::InteractionType;

impl Telemetry {
    /// Records that a page was viewed.
    pub fn page_view(&self, page_name: &str) {
        self.capture(
            InteractionType::PageView,
            Some(json!({ "pageName": page_name })),
        );
    }

    /// Records a button click, optionally with where it was clicked.
    pub fn button_click(&self, button_id: &str, context: Option<&str>) {
        let mut metadata = json!({ "buttonId": button_id });
        if let Some(context) = context {
            metadata["context"] = Value::from(context);
        }
        self.capture(InteractionType::ButtonClick, Some(metadata));
    }

    /// Records that a learning resource was opened.
    pub fn resource_access(&self, resource_id: &str, resource_type: &str) {
        self.capture(
            InteractionType::ResourceAccess,
            Some(json!({
                "resourceId": resource_id,
                "resourceType": resource_type,
            })),
        );
    }

    /// Records video playback progress.
    pub fn video_progress(&self, video_id: &str, progress_percent: f64, watch_time_secs: u64) {
        self.capture(
            InteractionType::VideoProgress,
            Some(json!({
                "videoId": video_id,
                "progressPercent": progress_percent,
                "watchTime": watch_time_secs,
            })),
        );
    }

    pub fn quiz_start(&self, quiz_id: &str) {
        self.capture(InteractionType::QuizStart, Some(json!({ "quizId": quiz_id })));
    }

    /// Records a finished quiz. Flushes immediately.
    pub fn quiz_complete(&self, quiz_id: &str, score: f64, time_spent_secs: u64) {
        self.capture(
            InteractionType::QuizComplete,
            Some(json!({
                "quizId": quiz_id,
                "score": score,
                "timeSpent": time_spent_secs,
            })),
        );
    }

    pub fn assessment_start(&self, assessment_id: &str) {
        self.capture(
            InteractionType::AssessmentStart,
            Some(json!({ "assessmentId": assessment_id })),
        );
    }

    /// Records a finished assessment. Flushes immediately.
    pub fn assessment_complete(&self, assessment_id: &str, score: f64, time_spent_secs: u64) {
        self.capture(
            InteractionType::AssessmentComplete,
            Some(json!({
                "assessmentId": assessment_id,
                "score": score,
                "timeSpent": time_spent_secs,
            })),
        );
    }

    pub fn hint_request(&self, question_id: &str, hint_level: u32) {
        self.capture(
            InteractionType::HintRequest,
            Some(json!({
                "questionId": question_id,
                "hintLevel": hint_level,
            })),
        );
    }

    /// Records submitted feedback. Flushes immediately.
    pub fn feedback_submit(&self, feedback_type: &str, rating: Option<u8>) {
        let mut metadata = json!({ "feedbackType": feedback_type });
        if let Some(rating) = rating {
            metadata["rating"] = Value::from(rating);
        }
        self.capture(InteractionType::FeedbackSubmit, Some(metadata));
    }

    pub fn reflection_submit(&self, topic_id: &str, word_count: usize) {
        self.capture(
            InteractionType::ReflectionSubmit,
            Some(json!({
                "topicId": topic_id,
                "wordCount": word_count,
            })),
        );
    }

    /// Records an awarded badge. Flushes immediately.
    pub fn badge_earned(&self, badge_id: &str, badge_name: &str) {
        self.capture(
            InteractionType::BadgeEarned,
            Some(json!({
                "badgeId": badge_id,
                "badgeName": badge_name,
            })),
        );
    }

    pub fn streak_achieved(&self, streak_days: u32) {
        self.capture(
            InteractionType::StreakAchieved,
            Some(json!({ "streakDays": streak_days })),
        );
    }

    pub fn topic_complete(&self, topic_id: &str, time_spent_secs: u64) {
        self.capture(
            InteractionType::TopicComplete,
            Some(json!({
                "topicId": topic_id,
                "timeSpent": time_spent_secs,
            })),
        );
    }

    /// Records an application error as `error_occurred`. Flushes immediately.
    pub fn error(&self, message: &str, context: Option<&str>) {
        let mut metadata = json!({ "errorMessage": message });
        if let Some(context) = context {
            metadata["context"] = Value::from(context);
        }
        self.capture(InteractionType::ErrorOccurred, Some(metadata));
    }
}
