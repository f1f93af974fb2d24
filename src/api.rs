use std::fmt::Display;

/// Internal execute steps.
pub const EXECUTION_EXCHANGE: &str = "execution";
/// Activity life cycle events.
pub const EVENT_EXCHANGE: &str = "event";
/// External commands.
pub const API_EXCHANGE: &str = "api";

pub const EXECUTE_START: &str = "execute.start";
pub const EXECUTE_COMPLETED: &str = "execute.completed";
pub const EXECUTE_DISCARD: &str = "execute.discard";
pub const EXECUTE_ERROR: &str = "execute.error";
pub const EXECUTE_DETACH: &str = "execute.detach";
pub const EXECUTE_EXPECT: &str = "execute.expect";
pub const EXECUTE_ITERATION_NEXT: &str = "execute.iteration.next";
pub const EXECUTE_ITERATION_COMPLETED: &str = "execute.iteration.completed";
pub const EXECUTE_ITERATION_BATCH: &str = "execute.iteration.batch";

pub const ACTIVITY_WAIT: &str = "activity.wait";
pub const ACTIVITY_CANCEL: &str = "activity.cancel";
pub const ACTIVITY_COMPENSATE: &str = "activity.compensate";
pub const ACTIVITY_ESCALATE: &str = "activity.escalate";
pub const ACTIVITY_LINK: &str = "activity.link";
pub const ACTIVITY_LINK_DISCARD: &str = "activity.link.discard";
pub const ACTIVITY_CATCH: &str = "activity.catch";
pub const ACTIVITY_DETACH: &str = "activity.detach";
pub const ACTIVITY_DISCARD: &str = "activity.discard";
pub const ACTIVITY_TIMER: &str = "activity.timer";

/// Type of a message published on the api exchange, taken from the message `type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    Stop,
    Discard,
    Compensate,
    Escalate,
    Cancel,
    Link,
    Other,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Stop => "stop",
            ApiType::Discard => "discard",
            ApiType::Compensate => "compensate",
            ApiType::Escalate => "escalate",
            ApiType::Cancel => "cancel",
            ApiType::Link => "link",
            ApiType::Other => "other",
        }
    }
}

impl From<Option<&str>> for ApiType {
    fn from(value: Option<&str>) -> Self {
        match value {
            Some("stop") => ApiType::Stop,
            Some("discard") => ApiType::Discard,
            Some("compensate") => ApiType::Compensate,
            Some("escalate") => ApiType::Escalate,
            Some("cancel") => ApiType::Cancel,
            Some("link") => ApiType::Link,
            _ => ApiType::Other,
        }
    }
}

impl Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
