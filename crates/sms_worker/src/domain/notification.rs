use crate::domain::NotificationError;
use serde::{Deserialize, Serialize};

/// Request to send an SMS on behalf of a venue.
///
/// Field names follow the publisher's PascalCase contract; camelCase is
/// accepted as well and unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SmsNotificationRequested {
    #[serde(alias = "venueId")]
    pub venue_id: i32,
    /// Expected to carry a leading country code, e.g. "15555555555"
    #[serde(alias = "receiverPhone")]
    pub receiver_phone: String,
    #[serde(alias = "message")]
    pub message: String,
}

/// Decode a message body into a notification.
///
/// JSON `null` and blank bodies decode to nothing and are reported as
/// [`NotificationError::NullPayload`].
pub fn decode_notification(body: &[u8]) -> Result<SmsNotificationRequested, NotificationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(NotificationError::NullPayload);
    }

    let notification: Option<SmsNotificationRequested> = serde_json::from_slice(body)?;
    notification.ok_or(NotificationError::NullPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pascal_case() {
        let body = br#"{"VenueId":1,"ReceiverPhone":"15555555555","Message":"Order confirmed"}"#;
        let notification = decode_notification(body).unwrap();

        assert_eq!(
            notification,
            SmsNotificationRequested {
                venue_id: 1,
                receiver_phone: "15555555555".to_string(),
                message: "Order confirmed".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_camel_case_and_unknown_fields() {
        let body = br#"{"venueId":7,"receiverPhone":"4915112345678","message":"hi","Extra":true}"#;
        let notification = decode_notification(body).unwrap();

        assert_eq!(notification.venue_id, 7);
        assert_eq!(notification.receiver_phone, "4915112345678");
    }

    #[test]
    fn test_decode_null_is_null_payload() {
        assert!(matches!(
            decode_notification(b"null"),
            Err(NotificationError::NullPayload)
        ));
        assert!(matches!(
            decode_notification(b" null \n"),
            Err(NotificationError::NullPayload)
        ));
    }

    #[test]
    fn test_decode_blank_body_is_null_payload() {
        assert!(matches!(
            decode_notification(b""),
            Err(NotificationError::NullPayload)
        ));
        assert!(matches!(
            decode_notification(b"  \r\n"),
            Err(NotificationError::NullPayload)
        ));
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let err = decode_notification(b"not-json").unwrap_err();
        assert!(matches!(err, NotificationError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let err = decode_notification(br#"{"VenueId":1,"Message":"x"}"#).unwrap_err();
        assert!(err.to_string().contains("ReceiverPhone"));
    }

    #[test]
    fn test_decode_rejects_wrong_types() {
        assert!(matches!(
            decode_notification(br#"{"VenueId":"one","ReceiverPhone":"1","Message":"x"}"#),
            Err(NotificationError::Decode(_))
        ));
        assert!(matches!(
            decode_notification(br#"{"VenueId":4294967296,"ReceiverPhone":"1","Message":"x"}"#),
            Err(NotificationError::Decode(_))
        ));
        assert!(matches!(
            decode_notification(b"[1,2,3]"),
            Err(NotificationError::Decode(_))
        ));
    }
}
