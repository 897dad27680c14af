//! User profiles and presence over REST.

use std::sync::Arc;

use crate::http::{ApiError, RequestDispatcher};
use crate::types::{PresenceInfo, UpdateProfileParams, User, UserProfile};

const USERS_ENDPOINT: &str = "/api/v1/users";
const ME_ENDPOINT: &str = "/api/v1/users/me";

fn user_endpoint(user_id: &str) -> String {
    format!("{USERS_ENDPOINT}/{user_id}")
}

fn presence_endpoint(user_id: &str) -> String {
    format!("{USERS_ENDPOINT}/{user_id}/presence")
}

/// User operations exposed on the session.
#[derive(Clone)]
pub struct UsersApi {
    http: Arc<RequestDispatcher>,
}

impl UsersApi {
    pub(crate) fn new(http: Arc<RequestDispatcher>) -> Self {
        Self { http }
    }

    /// Fetches the current user's profile.
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        self.http.get(ME_ENDPOINT, &[]).await
    }

    /// Fetches one user.
    pub async fn get(&self, user_id: &str) -> Result<User, ApiError> {
        self.http.get(&user_endpoint(user_id), &[]).await
    }

    /// Fetches several users at once.
    pub async fn get_many(&self, user_ids: &[&str]) -> Result<Vec<User>, ApiError> {
        let query = [("ids", user_ids.join(","))];
        self.http.get(USERS_ENDPOINT, &query).await
    }

    /// Updates the current user's profile.
    pub async fn update_profile(
        &self,
        params: &UpdateProfileParams,
    ) -> Result<UserProfile, ApiError> {
        self.http.put(ME_ENDPOINT, params).await
    }

    /// Fetches one user's presence.
    pub async fn presence(&self, user_id: &str) -> Result<PresenceInfo, ApiError> {
        self.http.get(&presence_endpoint(user_id), &[]).await
    }

    /// Fetches several users' presence at once.
    pub async fn presence_many(&self, user_ids: &[&str]) -> Result<Vec<PresenceInfo>, ApiError> {
        let query = [("ids", user_ids.join(","))];
        self.http
            .get(&format!("{USERS_ENDPOINT}/presence"), &query)
            .await
    }
}
