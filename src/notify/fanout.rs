/// Notification fan-out
///
/// Turns one domain event into the notification records of every affected
/// user. Titles, messages, priorities and action URLs are fixed per event
/// shape.
use crate::{
    error::HubResult,
    notify::{NewNotification, Notification, NotificationPayload, NotificationPriority, Notifier},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Longest message preview carried in a chat notification
const MESSAGE_PREVIEW_CHARS: usize = 100;

/// Booking details needed to address its notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub photographer_id: String,
    pub photographer_name: String,
    pub event_date: String,
}

impl Booking {
    fn payload(&self) -> NotificationPayload {
        NotificationPayload::Booking {
            booking_id: self.id.clone(),
            customer_id: self.customer_id.clone(),
            photographer_id: self.photographer_id.clone(),
            event_date: Some(self.event_date.clone()),
        }
    }

    fn action_url(&self) -> String {
        format!("/bookings/{}", self.id)
    }
}

/// Chat message summary used by the new-message fan-out
#[derive(Debug, Clone)]
pub struct MessageNotice<'a> {
    pub chat_id: &'a str,
    pub message_id: &'a str,
    pub sender_id: &'a str,
    pub sender_name: &'a str,
    pub content: &'a str,
}

fn preview(content: &str) -> String {
    if content.chars().count() <= MESSAGE_PREVIEW_CHARS {
        return content.to_string();
    }
    let cut: String = content.chars().take(MESSAGE_PREVIEW_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// Outcome of notifying one recipient
#[derive(Debug)]
pub struct Delivery {
    pub recipient: String,
    pub outcome: HubResult<Notification>,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn notification(&self) -> Option<&Notification> {
        self.outcome.as_ref().ok()
    }
}

/// Canonical notification shapes
#[derive(Clone)]
pub struct FanOut {
    notifier: Notifier,
}

impl FanOut {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Booking created: the customer hears the request was sent, the
    /// photographer gets a high-priority request
    ///
    /// Both parties are attempted independently; each has its own outcome.
    pub async fn booking_created(&self, booking: &Booking) -> Vec<Delivery> {
        let customer = NewNotification::new(
            &booking.customer_id,
            "Booking request sent",
            format!(
                "Your booking request for {} has been sent to {}.",
                booking.event_date, booking.photographer_name
            ),
            booking.payload(),
        )
        .action_url(booking.action_url())
        .priority(NotificationPriority::Normal);

        let photographer = NewNotification::new(
            &booking.photographer_id,
            "New booking request",
            format!(
                "{} has requested a booking for {}.",
                booking.customer_name, booking.event_date
            ),
            booking.payload(),
        )
        .action_url(booking.action_url())
        .priority(NotificationPriority::High);

        let mut deliveries = Vec::with_capacity(2);
        for request in [customer, photographer] {
            let delivery = self.deliver(request).await;
            if let Err(e) = &delivery.outcome {
                warn!(
                    booking_id = %booking.id,
                    recipient = %delivery.recipient,
                    error = %e,
                    "Failed to send booking request notification"
                );
            }
            deliveries.push(delivery);
        }

        info!(
            booking_id = %booking.id,
            delivered = deliveries.iter().filter(|d| d.is_delivered()).count(),
            "Sent booking request notifications"
        );
        deliveries
    }

    /// Booking confirmed: customer only
    pub async fn booking_confirmed(&self, booking: &Booking) -> HubResult<Notification> {
        let notification = self
            .notifier
            .notify(
                NewNotification::new(
                    &booking.customer_id,
                    "Booking confirmed",
                    format!(
                        "{} has confirmed your booking for {}.",
                        booking.photographer_name, booking.event_date
                    ),
                    booking.payload(),
                )
                .action_url(booking.action_url())
                .priority(NotificationPriority::High),
            )
            .await?;

        info!(booking_id = %booking.id, "Sent booking confirmation");
        Ok(notification)
    }

    /// New chat message: every recipient except the sender
    ///
    /// A failed insert does not stop the remaining recipients; the result
    /// carries one outcome per recipient.
    pub async fn new_message(
        &self,
        message: &MessageNotice<'_>,
        recipients: &[String],
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(recipients.len());
        let body = preview(message.content);

        for recipient in recipients.iter().filter(|r| r.as_str() != message.sender_id) {
            let request = NewNotification::new(
                recipient,
                format!("New message from {}", message.sender_name),
                body.clone(),
                NotificationPayload::Message {
                    chat_id: message.chat_id.to_string(),
                    message_id: message.message_id.to_string(),
                    sender_id: message.sender_id.to_string(),
                },
            )
            .action_url(format!("/chat/{}", message.chat_id))
            .priority(NotificationPriority::Normal);

            let delivery = self.deliver(request).await;
            if let Err(e) = &delivery.outcome {
                warn!(
                    chat_id = %message.chat_id,
                    recipient = %recipient,
                    error = %e,
                    "Failed to notify chat participant"
                );
            }
            deliveries.push(delivery);
        }
        deliveries
    }

    /// Verified face match for a registered attendee
    pub async fn photo_match_found(
        &self,
        user_id: &str,
        photo_id: &str,
        event_id: Option<&str>,
        event_name: &str,
        confidence_percent: f64,
    ) -> HubResult<Notification> {
        self.notifier
            .notify(
                NewNotification::new(
                    user_id,
                    "New photo match found!",
                    format!(
                        "You appear in a photo from {} ({:.0}% match).",
                        event_name, confidence_percent
                    ),
                    NotificationPayload::PhotoMatch {
                        photo_id: photo_id.to_string(),
                        event_id: event_id.map(str::to_string),
                        confidence: confidence_percent,
                    },
                )
                .action_url("/gallery")
                .priority(NotificationPriority::Normal),
            )
            .await
    }

    /// Event announcement to a set of attendees, one outcome per attendee
    pub async fn event_update(
        &self,
        event_id: &str,
        user_ids: &[String],
        title: &str,
        message: &str,
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let request = NewNotification::new(
                user_id,
                title,
                message,
                NotificationPayload::EventUpdate {
                    event_id: event_id.to_string(),
                },
            )
            .action_url(format!("/events/{}", event_id));

            let delivery = self.deliver(request).await;
            if let Err(e) = &delivery.outcome {
                warn!(event_id, user_id = %user_id, error = %e, "Failed to send event update");
            }
            deliveries.push(delivery);
        }
        deliveries
    }

    async fn deliver(&self, request: NewNotification) -> Delivery {
        let recipient = request.user_id.clone();
        Delivery {
            recipient,
            outcome: self.notifier.notify(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::HubError;
    use crate::notify::NotificationType;
    use crate::store::testing::{HookedStore, StoreHooks};
    use crate::store::{tables, RecordStore, Row, SqliteRecordStore};
    use std::sync::Arc;

    async fn fanout() -> FanOut {
        let pool = db::connect_in_memory().await.unwrap();
        FanOut::new(Notifier::new(Arc::new(SqliteRecordStore::new(pool)), 30))
    }

    fn booking() -> Booking {
        Booking {
            id: "b1".to_string(),
            customer_id: "c1".to_string(),
            customer_name: "Dana".to_string(),
            photographer_id: "p1".to_string(),
            photographer_name: "Eli".to_string(),
            event_date: "2024-07-04".to_string(),
        }
    }

    #[tokio::test]
    async fn test_booking_created_notifies_both_parties() {
        let fanout = fanout().await;
        let deliveries = fanout.booking_created(&booking()).await;
        let sent: Vec<_> = deliveries.iter().filter_map(Delivery::notification).collect();

        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].user_id, "c1");
        assert_eq!(sent[0].title, "Booking request sent");
        assert_eq!(sent[0].priority, NotificationPriority::Normal);
        assert_eq!(sent[1].user_id, "p1");
        assert_eq!(sent[1].title, "New booking request");
        assert_eq!(sent[1].priority, NotificationPriority::High);
        assert!(sent
            .iter()
            .all(|n| n.action_url.as_deref() == Some("/bookings/b1")));
    }

    #[tokio::test]
    async fn test_booking_confirmed_notifies_customer_only() {
        let fanout = fanout().await;
        let sent = fanout.booking_confirmed(&booking()).await.unwrap();

        assert_eq!(sent.user_id, "c1");
        assert_eq!(sent.priority, NotificationPriority::High);
        assert_eq!(fanout.notifier().unread_count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_message_skips_sender_and_truncates() {
        let fanout = fanout().await;
        let content = "x".repeat(150);
        let notice = MessageNotice {
            chat_id: "chat1",
            message_id: "m1",
            sender_id: "u1",
            sender_name: "Ana",
            content: &content,
        };

        let deliveries = fanout
            .new_message(&notice, &["u1".to_string(), "u2".to_string(), "u3".to_string()])
            .await;
        let sent: Vec<_> = deliveries.iter().filter_map(Delivery::notification).collect();

        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|n| n.user_id != "u1"));
        assert_eq!(sent[0].title, "New message from Ana");
        assert_eq!(sent[0].action_url.as_deref(), Some("/chat/chat1"));
        assert_eq!(sent[0].message.chars().count(), MESSAGE_PREVIEW_CHARS + 3);
        assert_eq!(sent[0].kind, NotificationType::Message);
    }

    #[tokio::test]
    async fn test_photo_match_message() {
        let fanout = fanout().await;
        let sent = fanout
            .photo_match_found("u1", "p1", Some("e1"), "Summer Gala", 87.4)
            .await
            .unwrap();

        assert_eq!(sent.title, "New photo match found!");
        assert_eq!(sent.message, "You appear in a photo from Summer Gala (87% match).");
        assert_eq!(sent.action_url.as_deref(), Some("/gallery"));
        assert_eq!(sent.priority, NotificationPriority::Normal);
    }

    #[tokio::test]
    async fn test_event_update_skips_invalid_targets() {
        let fanout = fanout().await;
        let deliveries = fanout
            .event_update("e1", &["u1".to_string(), "".to_string()], "Schedule", "Doors at 6")
            .await;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(
            deliveries[0].notification().map(|n| n.kind),
            Some(NotificationType::EventUpdate)
        );
        assert_eq!(deliveries[1].recipient, "");
        assert!(matches!(deliveries[1].outcome, Err(HubError::Validation(_))));
    }

    /// Fails every notification insert addressed to one user
    struct UnreachableRecipient(&'static str);

    #[async_trait::async_trait]
    impl StoreHooks for UnreachableRecipient {
        async fn before_insert(
            &self,
            _inner: &dyn RecordStore,
            table: &str,
            row: &Row,
        ) -> HubResult<()> {
            if table == tables::NOTIFICATIONS
                && row.get("user_id").and_then(|v| v.as_str()) == Some(self.0)
            {
                return Err(HubError::Transport("notification shard offline".to_string()));
            }
            Ok(())
        }
    }

    async fn fanout_failing_for(user: &'static str) -> FanOut {
        let pool = db::connect_in_memory().await.unwrap();
        let inner: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));
        let store = Arc::new(HookedStore::new(inner, UnreachableRecipient(user)));
        FanOut::new(Notifier::new(store, 30))
    }

    #[tokio::test]
    async fn test_new_message_reports_each_recipient() {
        let fanout = fanout_failing_for("u2").await;
        let notice = MessageNotice {
            chat_id: "chat1",
            message_id: "m1",
            sender_id: "u1",
            sender_name: "Ana",
            content: "see you at the venue",
        };

        let deliveries = fanout
            .new_message(&notice, &["u1".to_string(), "u2".to_string(), "u3".to_string()])
            .await;

        let outcomes: Vec<_> = deliveries
            .iter()
            .map(|d| (d.recipient.as_str(), d.is_delivered()))
            .collect();
        assert_eq!(outcomes, vec![("u2", false), ("u3", true)]);
        assert!(matches!(deliveries[0].outcome, Err(HubError::Transport(_))));
        assert_eq!(fanout.notifier().unread_count("u3").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_booking_created_attempts_photographer_after_customer_failure() {
        let fanout = fanout_failing_for("c1").await;

        let deliveries = fanout.booking_created(&booking()).await;

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].recipient, "c1");
        assert!(!deliveries[0].is_delivered());
        assert_eq!(deliveries[1].recipient, "p1");
        assert!(deliveries[1].is_delivered());
        assert_eq!(fanout.notifier().unread_count("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_event_update_reports_unreachable_attendee() {
        let fanout = fanout_failing_for("u1").await;
        let deliveries = fanout
            .event_update("e1", &["u1".to_string(), "u2".to_string()], "Venue", "Moved indoors")
            .await;

        let missed: Vec<_> = deliveries
            .iter()
            .filter(|d| !d.is_delivered())
            .map(|d| d.recipient.as_str())
            .collect();
        assert_eq!(missed, vec!["u1"]);
    }

    #[test]
    fn test_preview_short_message_unchanged() {
        assert_eq!(preview("hello"), "hello");
    }
}
