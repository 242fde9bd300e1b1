// Notifications
//
// Event fan-out: rules route proxy events to named channels with per-key
// throttling (notifications), message bodies render through a small
// mustache-style template engine (template), and webhook egress is
// produced, signed and recorded in a bounded delivery log (webhook_log).

pub mod notifications;
pub mod template;
pub mod webhook_log;

pub use notifications::{
    NotificationChannel, NotificationConfig, NotificationManager, NotificationRecord,
    NotificationRule, NotificationStatus,
};
pub use template::WebhookTemplateEngine;
pub use webhook_log::{
    DeliveryStatus, WebhookDelivery, WebhookDeliveryLog, WebhookDispatcher, WebhookEndpoint,
};
