mod sms_notification_consumer;
mod sms_notification_service;

pub use sms_notification_consumer::*;
pub use sms_notification_service::*;
