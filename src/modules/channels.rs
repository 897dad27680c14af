//! Channel management: CRUD over REST plus typing signals over the realtime
//! connection.

use std::sync::Arc;

use serde_json::json;

use crate::auth::CredentialStore;
use crate::events::{EventBus, ListenerHandle, SessionEvent};
use crate::http::{ApiError, RequestDispatcher};
use crate::realtime::connection::{
    RealtimeConnection, RealtimeError, RealtimePayload, SubscriptionHandle,
};
use crate::types::{
    Channel, CreateChannelParams, ListChannelsParams, PaginatedResponse, UpdateChannelParams,
};

const CHANNELS_ENDPOINT: &str = "/api/v1/chat/channels";
const TYPING_START_DESTINATION: &str = "/app/typing/start";
const TYPING_STOP_DESTINATION: &str = "/app/typing/stop";

fn channel_endpoint(channel_id: &str) -> String {
    format!("{CHANNELS_ENDPOINT}/{channel_id}")
}

fn leave_endpoint(channel_id: &str) -> String {
    format!("{CHANNELS_ENDPOINT}/{channel_id}/leave")
}

fn typing_topic(channel_id: &str) -> String {
    format!("/topic/channel.{channel_id}.typing")
}

/// Channel operations exposed on the session.
#[derive(Clone)]
pub struct ChannelsApi {
    http: Arc<RequestDispatcher>,
    realtime: Arc<RealtimeConnection>,
    events: Arc<EventBus>,
    credentials: Arc<CredentialStore>,
}

impl ChannelsApi {
    pub(crate) fn new(
        http: Arc<RequestDispatcher>,
        realtime: Arc<RealtimeConnection>,
        events: Arc<EventBus>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            http,
            realtime,
            events,
            credentials,
        }
    }

    /// Creates a channel and emits `channel.created`.
    pub async fn create(&self, params: &CreateChannelParams) -> Result<Channel, ApiError> {
        let channel: Channel = self.http.post(CHANNELS_ENDPOINT, params).await?;
        self.events.emit(SessionEvent::ChannelCreated {
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Lists channels, paginated.
    pub async fn list(
        &self,
        params: &ListChannelsParams,
    ) -> Result<PaginatedResponse<Channel>, ApiError> {
        let mut query = vec![
            ("page", params.page.unwrap_or(0).to_string()),
            ("size", params.size.unwrap_or(20).to_string()),
        ];
        if let Some(channel_type) = params.channel_type {
            query.push(("type", channel_type.as_str().to_string()));
        }
        self.http.get(CHANNELS_ENDPOINT, &query).await
    }

    /// Fetches one channel.
    pub async fn get(&self, channel_id: &str) -> Result<Channel, ApiError> {
        self.http.get(&channel_endpoint(channel_id), &[]).await
    }

    /// Updates a channel and emits `channel.updated`.
    pub async fn update(
        &self,
        channel_id: &str,
        params: &UpdateChannelParams,
    ) -> Result<Channel, ApiError> {
        let channel: Channel = self.http.put(&channel_endpoint(channel_id), params).await?;
        self.events.emit(SessionEvent::ChannelUpdated {
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Leaves a channel and emits `channel.member.left` for the current user.
    pub async fn leave(&self, channel_id: &str) -> Result<(), ApiError> {
        self.http.delete::<()>(&leave_endpoint(channel_id)).await?;
        let user_id = self.credentials.user_id().unwrap_or_else(|| "self".to_string());
        self.events.emit(SessionEvent::MemberLeft {
            channel_id: channel_id.to_string(),
            user_id,
        });
        Ok(())
    }

    /// Deletes a channel (admin only) and emits `channel.deleted`.
    pub async fn delete(&self, channel_id: &str) -> Result<(), ApiError> {
        self.http.delete::<()>(&channel_endpoint(channel_id)).await?;
        self.events.emit(SessionEvent::ChannelDeleted {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    /// Announces that the current user started typing in `channel_id`.
    pub fn start_typing(&self, channel_id: &str) -> Result<(), RealtimeError> {
        self.realtime
            .publish(TYPING_START_DESTINATION, &json!({ "channelId": channel_id }))
    }

    /// Announces that the current user stopped typing in `channel_id`.
    pub fn stop_typing(&self, channel_id: &str) -> Result<(), RealtimeError> {
        self.realtime
            .publish(TYPING_STOP_DESTINATION, &json!({ "channelId": channel_id }))
    }

    /// Subscribes to the channel's typing topic.
    pub fn on_typing<F>(&self, channel_id: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(RealtimePayload) + Send + Sync + 'static,
    {
        self.realtime.subscribe(&typing_topic(channel_id), handler)
    }

    /// Listens for `channel.created` bus events.
    pub fn on_channel_created<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.events.on("channel.created", move |event| {
            if let SessionEvent::ChannelCreated { channel } = event {
                listener(channel);
            }
        })
    }

    /// Listens for `channel.updated` bus events.
    pub fn on_channel_updated<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.events.on("channel.updated", move |event| {
            if let SessionEvent::ChannelUpdated { channel } = event {
                listener(channel);
            }
        })
    }

    /// Listens for `channel.deleted` bus events.
    pub fn on_channel_deleted<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on("channel.deleted", move |event| {
            if let SessionEvent::ChannelDeleted { channel_id } = event {
                listener(channel_id);
            }
        })
    }

    /// Listens for `channel.member.joined` bus events.
    pub fn on_member_joined<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.events.on("channel.member.joined", move |event| {
            if let SessionEvent::MemberJoined {
                channel_id,
                user_id,
            } = event
            {
                listener(channel_id, user_id);
            }
        })
    }

    /// Listens for `channel.member.left` bus events.
    pub fn on_member_left<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.events.on("channel.member.left", move |event| {
            if let SessionEvent::MemberLeft {
                channel_id,
                user_id,
            } = event
            {
                listener(channel_id, user_id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{channel_endpoint, leave_endpoint, typing_topic};

    #[test]
    fn endpoints_follow_backend_layout() {
        assert_eq!(channel_endpoint("ch-1"), "/api/v1/chat/channels/ch-1");
        assert_eq!(leave_endpoint("ch-1"), "/api/v1/chat/channels/ch-1/leave");
        assert_eq!(typing_topic("ch-1"), "/topic/channel.ch-1.typing");
    }
}
