use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification channel type. Doubles as the routing key on the primary exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    Push,
}

impl ChannelType {
    pub const ALL: [ChannelType; 2] = [ChannelType::Email, ChannelType::Push];

    /// Routing key used when publishing to the primary exchange.
    pub fn routing_key(self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Push => "push",
        }
    }

    /// Name of the primary queue that holds this channel's notifications.
    pub fn queue_name(self) -> &'static str {
        match self {
            ChannelType::Email => "email.queue",
            ChannelType::Push => "push.queue",
        }
    }

    /// Name of the downstream provider dependency, used as the circuit breaker key.
    pub fn provider_name(self) -> &'static str {
        match self {
            ChannelType::Email => "email-provider",
            ChannelType::Push => "push-provider",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Incoming notification request accepted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    #[serde(rename = "type")]
    pub channel: ChannelType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub template_id: Option<String>,
    /// Device token for push notifications.
    #[serde(default)]
    pub token: Option<String>,
}

impl NotificationRequest {
    /// Reject requests with blank required fields.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.user_id.trim().is_empty() {
            missing.push("user_id");
        }
        if self.title.trim().is_empty() {
            missing.push("title");
        }
        if self.message.trim().is_empty() {
            missing.push("message");
        }
        missing
    }
}

/// A notification as carried on the queue, consumed by delivery workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub notification_id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub channel: ChannelType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl NotificationMessage {
    /// Build the queued form of a request under a freshly generated id.
    pub fn from_request(request: NotificationRequest) -> Self {
        Self {
            notification_id: Uuid::new_v4(),
            user_id: request.user_id,
            channel: request.channel,
            title: request.title,
            message: request.message,
            template_id: request.template_id,
            token: request.token,
        }
    }
}

/// Last known delivery status of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub notification_id: Uuid,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_field_parses_channel() {
        let request: NotificationRequest = serde_json::from_value(serde_json::json!({
            "user_id": "u-1",
            "type": "push",
            "title": "Hello",
            "message": "World"
        }))
        .unwrap();
        assert_eq!(request.channel, ChannelType::Push);
        assert!(request.missing_fields().is_empty());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_value::<NotificationRequest>(serde_json::json!({
            "user_id": "u-1",
            "type": "sms",
            "title": "Hello",
            "message": "World"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_fields_reported() {
        let request = NotificationRequest {
            user_id: " ".to_string(),
            channel: ChannelType::Email,
            title: String::new(),
            message: "body".to_string(),
            template_id: None,
            token: None,
        };
        assert_eq!(request.missing_fields(), vec!["user_id", "title"]);
    }

    #[test]
    fn test_channel_routing() {
        assert_eq!(ChannelType::Email.routing_key(), "email");
        assert_eq!(ChannelType::Push.queue_name(), "push.queue");
        assert_eq!(ChannelType::Push.to_string(), "push");
    }

    #[test]
    fn test_message_omits_absent_optionals() {
        let message = NotificationMessage::from_request(NotificationRequest {
            user_id: "u-1".to_string(),
            channel: ChannelType::Email,
            title: "t".to_string(),
            message: "m".to_string(),
            template_id: None,
            token: None,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "email");
        assert!(json.get("token").is_none());
    }
}
