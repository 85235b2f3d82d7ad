//! Event enrichment.
//!
//! Turns a raw `(interaction, metadata)` pair into an [`InteractionEvent`] by
//! attaching session, page and device context. Enrichment never fails: facts
//! the runtime cannot provide are omitted, and metadata that is not a JSON
//! object is preserved under a `value` key.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::context::RuntimeContext;
use crate::types::{DeviceClass, InteractionEvent, InteractionType};

/// Widest viewport still classified as mobile.
pub const MOBILE_MAX_WIDTH: u32 = 768;

/// Widest viewport still classified as tablet.
pub const TABLET_MAX_WIDTH: u32 = 1024;

/// Metadata key for the device class.
pub const KEY_DEVICE_TYPE: &str = "deviceType";
/// Metadata key for the user agent string.
pub const KEY_USER_AGENT: &str = "userAgent";
/// Metadata key for the screen resolution.
pub const KEY_SCREEN_RESOLUTION: &str = "screenResolution";
/// Metadata key for the redundant capture timestamp.
pub const KEY_TIMESTAMP: &str = "timestamp";

/// Classifies a viewport width.
///
/// ```
/// use studytrail_telemetry::enrich::classify_device;
/// use studytrail_telemetry::types::DeviceClass;
///
/// assert_eq!(classify_device(768), DeviceClass::Mobile);
/// assert_eq!(classify_device(769), DeviceClass::Tablet);
/// assert_eq!(classify_device(1025), DeviceClass::Desktop);
/// ```
#[must_use]
pub fn classify_device(viewport_width: u32) -> DeviceClass {
    if viewport_width <= MOBILE_MAX_WIDTH {
        DeviceClass::Mobile
    } else if viewport_width <= TABLET_MAX_WIDTH {
        DeviceClass::Tablet
    } else {
        DeviceClass::Desktop
    }
}

/// Normalizes caller metadata into a JSON object.
fn into_object(metadata: Option<Value>) -> Map<String, Value> {
    match metadata {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Builds an enriched event.
///
/// Derived keys (`deviceType`, `userAgent`, `screenResolution`,
/// `timestamp`) override caller keys of the same name.
#[must_use]
pub fn build_event(
    interaction_type: InteractionType,
    metadata: Option<Value>,
    session_id: &str,
    context: &dyn RuntimeContext,
    now: DateTime<Utc>,
) -> InteractionEvent {
    let page = context.page();
    let device = context.device();
    let mut metadata = into_object(metadata);

    if let Some(width) = device.viewport_width {
        metadata.insert(
            KEY_DEVICE_TYPE.to_string(),
            Value::from(classify_device(width).as_str()),
        );
    }
    if let Some(user_agent) = device.user_agent {
        metadata.insert(KEY_USER_AGENT.to_string(), Value::from(user_agent));
    }
    if let Some(screen) = device.screen {
        metadata.insert(
            KEY_SCREEN_RESOLUTION.to_string(),
            Value::from(screen.to_string()),
        );
    }
    metadata.insert(
        KEY_TIMESTAMP.to_string(),
        Value::from(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );

    InteractionEvent {
        interaction_type,
        page_url: page.url,
        referrer_url: page.referrer,
        metadata,
        session_id: session_id.to_string(),
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeviceInfo, PageContext, ScreenResolution};
    use serde_json::json;

    fn full_context() -> PageContext {
        PageContext::new("https://learn.example.com/topics").with_device(DeviceInfo {
            viewport_width: Some(1440),
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
            screen: Some(ScreenResolution {
                width: 2560,
                height: 1440,
            }),
        })
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-05T10:15:30.250Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn device_classification_boundaries() {
        assert_eq!(classify_device(0), DeviceClass::Mobile);
        assert_eq!(classify_device(768), DeviceClass::Mobile);
        assert_eq!(classify_device(769), DeviceClass::Tablet);
        assert_eq!(classify_device(1024), DeviceClass::Tablet);
        assert_eq!(classify_device(1025), DeviceClass::Desktop);
        assert_eq!(classify_device(3840), DeviceClass::Desktop);
    }

    #[test]
    fn enrichment_injects_device_context() {
        let event = build_event(
            InteractionType::PageView,
            Some(json!({"pageName": "Topics"})),
            "s-1",
            &full_context(),
            fixed_now(),
        );

        assert_eq!(event.session_id, "s-1");
        assert_eq!(event.page_url, "https://learn.example.com/topics");
        assert_eq!(event.timestamp, fixed_now());
        assert_eq!(event.metadata["pageName"], "Topics");
        assert_eq!(event.metadata["deviceType"], "desktop");
        assert_eq!(
            event.metadata["userAgent"],
            "Mozilla/5.0 (X11; Linux x86_64)"
        );
        assert_eq!(event.metadata["screenResolution"], "2560x1440");
        assert_eq!(event.metadata["timestamp"], "2024-03-05T10:15:30.250Z");
    }

    #[test]
    fn derived_keys_override_caller_keys() {
        let event = build_event(
            InteractionType::ButtonClick,
            Some(json!({"deviceType": "toaster", "buttonId": "save"})),
            "s-1",
            &full_context(),
            fixed_now(),
        );

        assert_eq!(event.metadata["deviceType"], "desktop");
        assert_eq!(event.metadata["buttonId"], "save");
    }

    #[test]
    fn missing_runtime_facts_are_omitted() {
        let event = build_event(
            InteractionType::PageView,
            None,
            "s-1",
            &PageContext::new("/"),
            fixed_now(),
        );

        assert!(event.metadata.get("deviceType").is_none());
        assert!(event.metadata.get("userAgent").is_none());
        assert!(event.metadata.get("screenResolution").is_none());
        assert!(event.metadata.get("timestamp").is_some());
    }

    #[test]
    fn non_object_metadata_is_preserved() {
        let event = build_event(
            InteractionType::Custom("note".to_string()),
            Some(json!(["a", "b"])),
            "s-1",
            &PageContext::new("/"),
            fixed_now(),
        );
        assert_eq!(event.metadata["value"], json!(["a", "b"]));

        let event = build_event(
            InteractionType::PageView,
            Some(Value::Null),
            "s-1",
            &PageContext::new("/"),
            fixed_now(),
        );
        assert!(event.metadata.get("value").is_none());
    }

    #[test]
    fn page_context_supplies_referrer() {
        let context = PageContext::new("/home");
        context.navigate("/quiz/3");

        let event = build_event(
            InteractionType::QuizStart,
            None,
            "s-1",
            &context,
            fixed_now(),
        );
        assert_eq!(event.page_url, "/quiz/3");
        assert_eq!(event.referrer_url.as_deref(), Some("/home"));
    }
}
