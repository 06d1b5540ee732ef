/// Shared types for the chat layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of a message created on this device
///
/// Transitions are one-way: Sending -> Sent or Sending -> Failed. Messages
/// fetched from the backend are already confirmed and carry Sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Sent,
    Failed,
}

/// Message identifier: server-assigned once confirmed, local until then
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageId {
    Server(i64),
    Temp(Uuid),
}

impl MessageId {
    pub fn server(&self) -> Option<i64> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Temp(_) => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, MessageId::Temp(_))
    }
}

/// One message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
    /// Server-assigned once confirmed; local clock for optimistic entries
    pub timestamp: DateTime<Utc>,
    /// Server-assigned read flag; never mutated on this side
    pub read: bool,
    pub delivery: DeliveryState,
}

impl Message {
    /// Build the optimistic placeholder appended before the send resolves
    pub fn optimistic(temp_id: Uuid, sender_id: i64, receiver_id: i64, text: &str) -> Self {
        Self {
            id: MessageId::Temp(temp_id),
            sender_id,
            receiver_id,
            text: text.to_string(),
            timestamp: Utc::now(),
            read: false,
            delivery: DeliveryState::Sending,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_temp()
    }

    pub fn is_from(&self, user_id: i64) -> bool {
        self.sender_id == user_id
    }

    /// Sending -> Sent; terminal states are left alone
    pub fn mark_sent(&mut self) {
        if self.delivery == DeliveryState::Sending {
            self.delivery = DeliveryState::Sent;
        }
    }

    /// Sending -> Failed; terminal states are left alone
    pub fn mark_failed(&mut self) {
        if self.delivery == DeliveryState::Sending {
            self.delivery = DeliveryState::Failed;
        }
    }
}

/// Presentation order of a conversation; the sort key is the timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Chronological history view
    OldestFirst,
    /// Inverted "latest first" view
    NewestFirst,
}

/// Summary of one conversation thread (for the trainer console list view)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// The client on the other end of the thread
    pub peer_id: i64,
    /// Preview text of the last message
    pub last_preview: String,
    /// Timestamp of the last message
    pub last_timestamp: DateTime<Utc>,
    /// Messages from the peer not yet marked read by the backend
    pub unread: usize,
}

/// Real-time events published by the chat engines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message arrived from the backend or was sent locally
    NewMessage { peer_id: i64, message: Message },
    /// An optimistic entry was confirmed with its server id
    MessageDelivered { id: i64, peer_id: i64 },
    /// A send request failed; the entry stays visible as failed
    SendFailed { peer_id: i64, text: String },
    /// A scheduled poll failed; self-heals on the next tick
    PollFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_transitions_are_one_way() {
        let temp = Uuid::new_v4();
        let mut msg = Message::optimistic(temp, 1, 2, "hello");
        assert_eq!(msg.delivery, DeliveryState::Sending);

        msg.mark_sent();
        assert_eq!(msg.delivery, DeliveryState::Sent);

        // Sent never reverts to Failed
        msg.mark_failed();
        assert_eq!(msg.delivery, DeliveryState::Sent);

        let mut msg = Message::optimistic(Uuid::new_v4(), 1, 2, "again");
        msg.mark_failed();
        assert_eq!(msg.delivery, DeliveryState::Failed);

        // Failed never reverts to Sent
        msg.mark_sent();
        assert_eq!(msg.delivery, DeliveryState::Failed);
    }
}
