//! Message management: send/list/edit/delete over REST plus realtime
//! subscriptions for inbound messages and read receipts.

use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::events::{EventBus, ListenerHandle, SessionEvent};
use crate::http::{ApiError, RequestDispatcher};
use crate::realtime::connection::{RealtimeConnection, RealtimePayload, SubscriptionHandle};
use crate::types::{
    ListMessagesParams, Message, PaginatedResponse, ReadReceipt, SendMessageParams,
};

/// Personal queue carrying new messages from every channel.
pub const USER_MESSAGES_DESTINATION: &str = "/user/queue/messages";
/// Personal queue carrying read receipts.
pub const READ_RECEIPTS_DESTINATION: &str = "/user/queue/read-receipts";

fn messages_endpoint(channel_id: &str) -> String {
    format!("/api/v1/chat/channels/{channel_id}/messages")
}

fn message_endpoint(channel_id: &str, message_id: &str) -> String {
    format!("/api/v1/chat/channels/{channel_id}/messages/{message_id}")
}

fn read_endpoint(channel_id: &str, message_id: &str) -> String {
    format!("/api/v1/chat/channels/{channel_id}/messages/{message_id}/read")
}

fn channel_topic(channel_id: &str) -> String {
    format!("/topic/channels/{channel_id}")
}

/// Message operations exposed on the session.
#[derive(Clone)]
pub struct MessagesApi {
    http: Arc<RequestDispatcher>,
    realtime: Arc<RealtimeConnection>,
    events: Arc<EventBus>,
}

impl MessagesApi {
    pub(crate) fn new(
        http: Arc<RequestDispatcher>,
        realtime: Arc<RealtimeConnection>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            http,
            realtime,
            events,
        }
    }

    /// Sends a message to a channel.
    pub async fn send(
        &self,
        channel_id: &str,
        params: &SendMessageParams,
    ) -> Result<Message, ApiError> {
        self.http.post(&messages_endpoint(channel_id), params).await
    }

    /// Lists channel messages, paginated and optionally bounded by message id.
    pub async fn list(
        &self,
        channel_id: &str,
        params: &ListMessagesParams,
    ) -> Result<PaginatedResponse<Message>, ApiError> {
        let mut query = vec![
            ("page", params.page.unwrap_or(0).to_string()),
            ("size", params.size.unwrap_or(20).to_string()),
        ];
        if let Some(before) = &params.before {
            query.push(("before", before.clone()));
        }
        if let Some(after) = &params.after {
            query.push(("after", after.clone()));
        }
        self.http.get(&messages_endpoint(channel_id), &query).await
    }

    /// Fetches one message.
    pub async fn get(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError> {
        self.http
            .get(&message_endpoint(channel_id, message_id), &[])
            .await
    }

    /// Edits a message's content and emits `message.updated`.
    pub async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, ApiError> {
        let message: Message = self
            .http
            .put(
                &message_endpoint(channel_id, message_id),
                &json!({ "content": content }),
            )
            .await?;
        self.events.emit(SessionEvent::MessageUpdated {
            channel_id: channel_id.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Deletes a message and emits `message.deleted`.
    pub async fn delete(&self, channel_id: &str, message_id: &str) -> Result<(), ApiError> {
        self.http
            .delete::<()>(&message_endpoint(channel_id, message_id))
            .await?;
        self.events.emit(SessionEvent::MessageDeleted {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    /// Marks a message as read.
    pub async fn mark_as_read(&self, channel_id: &str, message_id: &str) -> Result<(), ApiError> {
        self.http
            .post_empty::<()>(&read_endpoint(channel_id, message_id))
            .await
    }

    /// Subscribes the personal message queue (new messages from every
    /// channel), re-publishing each as a `message.new` bus event.
    pub fn subscribe_to_user_messages<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let events = Arc::clone(&self.events);
        self.realtime
            .subscribe(USER_MESSAGES_DESTINATION, move |payload| {
                let Some(message) = decode_message(&payload) else {
                    return;
                };
                events.emit(SessionEvent::MessageNew {
                    channel_id: message.channel_id.clone(),
                    message: message.clone(),
                });
                callback(message);
            })
    }

    /// Subscribes one channel's message topic, re-publishing each message as a
    /// `message.new` bus event.
    pub fn subscribe_to_channel<F>(&self, channel_id: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let events = Arc::clone(&self.events);
        let channel_id = channel_id.to_string();
        self.realtime
            .subscribe(&channel_topic(&channel_id), move |payload| {
                let Some(message) = decode_message(&payload) else {
                    return;
                };
                events.emit(SessionEvent::MessageNew {
                    channel_id: channel_id.clone(),
                    message: message.clone(),
                });
                callback(message);
            })
    }

    /// Subscribes the personal read-receipt queue, re-publishing each receipt
    /// as a `read.receipt` bus event.
    pub fn subscribe_to_read_receipts<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(ReadReceipt) + Send + Sync + 'static,
    {
        let events = Arc::clone(&self.events);
        self.realtime
            .subscribe(READ_RECEIPTS_DESTINATION, move |payload| {
                let Some(receipt) = decode_receipt(&payload) else {
                    return;
                };
                events.emit(SessionEvent::ReadReceipt {
                    receipt: receipt.clone(),
                });
                callback(receipt);
            })
    }

    /// Listens for `message.new` bus events.
    pub fn on_message<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str, &Message) + Send + Sync + 'static,
    {
        self.events.on("message.new", move |event| {
            if let SessionEvent::MessageNew {
                channel_id,
                message,
            } = event
            {
                listener(channel_id, message);
            }
        })
    }

    /// Listens for `message.updated` bus events.
    pub fn on_message_updated<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str, &Message) + Send + Sync + 'static,
    {
        self.events.on("message.updated", move |event| {
            if let SessionEvent::MessageUpdated {
                channel_id,
                message,
            } = event
            {
                listener(channel_id, message);
            }
        })
    }

    /// Listens for `message.deleted` bus events.
    pub fn on_message_deleted<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.events.on("message.deleted", move |event| {
            if let SessionEvent::MessageDeleted {
                channel_id,
                message_id,
            } = event
            {
                listener(channel_id, message_id);
            }
        })
    }

    /// Listens for `read.receipt` bus events.
    pub fn on_read_receipt<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ReadReceipt) + Send + Sync + 'static,
    {
        self.events.on("read.receipt", move |event| {
            if let SessionEvent::ReadReceipt { receipt } = event {
                listener(receipt);
            }
        })
    }
}

fn decode_message(payload: &RealtimePayload) -> Option<Message> {
    decode_payload(payload, "message")
}

fn decode_receipt(payload: &RealtimePayload) -> Option<ReadReceipt> {
    decode_payload(payload, "read receipt")
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: &RealtimePayload,
    kind: &str,
) -> Option<T> {
    let Some(value) = payload.as_json() else {
        warn!(kind, "dropping non-JSON realtime payload");
        return None;
    };
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(kind, error = %err, "dropping undecodable realtime payload");
            None
        }
    }
}
