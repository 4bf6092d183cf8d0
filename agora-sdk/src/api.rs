//! Typed callers for the auth, forum, and chat REST surfaces.
//!
//! Every call goes through the [`Gateway`], which owns bearer attachment and
//! the refresh/replay protocol; this layer only knows URLs, payloads, and
//! response shapes.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::credentials::{CredentialStore, TokenPair};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::types::{
    AdminStats, ChatMessage, ForumStats, NewPost, NewReply, Post, PostPatch, ProfilePatch, Reply,
    User,
};

/// Base URLs of the three services the client talks to.
#[derive(Debug, Clone)]
pub struct ServiceUrls {
    pub auth: String,
    pub forum: String,
    pub chat: String,
}

impl ServiceUrls {
    /// All three services behind one origin (the common deployment).
    pub fn single_origin(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            auth: base.clone(),
            forum: base.clone(),
            chat: base,
        }
    }
}

/// Client for the whole REST surface. Cheap to clone; all clones share the
/// same gateway and credential store.
#[derive(Clone)]
pub struct ApiClient {
    urls: Arc<ServiceUrls>,
    gateway: Arc<Gateway>,
}

impl ApiClient {
    pub fn new(urls: ServiceUrls, store: Arc<CredentialStore>) -> Self {
        let gateway = Arc::new(Gateway::new(&urls.auth, store));
        Self {
            urls: Arc::new(urls),
            gateway,
        }
    }

    pub fn with_gateway(urls: ServiceUrls, gateway: Arc<Gateway>) -> Self {
        Self {
            urls: Arc::new(urls),
            gateway,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.gateway.store()
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}{path}", self.urls.auth.trim_end_matches('/'))
    }

    fn forum_url(&self, path: &str) -> String {
        format!("{}{path}", self.urls.forum.trim_end_matches('/'))
    }

    fn chat_url(&self, path: &str) -> String {
        format!("{}{path}", self.urls.chat.trim_end_matches('/'))
    }

    // ── Auth ──

    /// Sign in and store the minted token pair.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<TokenPair, Error> {
        let builder = self
            .gateway
            .http()
            .post(self.auth_url("/auth/sign-in"))
            .json(&serde_json::json!({ "email": email, "password": password }));
        let pair: TokenPair = decode(self.gateway.send(builder).await?).await?;
        self.store().set(pair.clone());
        Ok(pair)
    }

    /// Register a new account and store the minted token pair.
    pub async fn sign_up(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenPair, Error> {
        let builder = self.gateway.http().post(self.auth_url("/auth/sign-up")).json(
            &serde_json::json!({ "username": username, "email": email, "password": password }),
        );
        let pair: TokenPair = decode(self.gateway.send(builder).await?).await?;
        self.store().set(pair.clone());
        Ok(pair)
    }

    /// Invalidate the session server-side, then drop it locally. Local state
    /// is cleared even when the server call fails.
    pub async fn logout(&self) -> Result<(), Error> {
        let result = match self.store().refresh_token() {
            Some(refresh_token) => {
                let builder = self
                    .gateway
                    .http()
                    .post(self.auth_url("/auth/logout"))
                    .json(&serde_json::json!({ "refresh_token": refresh_token }));
                match self.gateway.send(builder).await {
                    Ok(response) => expect_success(response).await,
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };
        self.store().clear();
        result
    }

    /// The signed-in account.
    pub async fn me(&self) -> Result<User, Error> {
        let builder = self.gateway.http().get(self.auth_url("/api/me"));
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn update_me(&self, patch: &ProfilePatch) -> Result<User, Error> {
        let builder = self
            .gateway
            .http()
            .put(self.auth_url("/api/me"))
            .json(patch);
        decode(self.gateway.send(builder).await?).await
    }

    // ── Forum ──

    pub async fn posts(&self) -> Result<Vec<Post>, Error> {
        let builder = self.gateway.http().get(self.forum_url("/api/posts"));
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn post(&self, id: i64) -> Result<Post, Error> {
        let builder = self
            .gateway
            .http()
            .get(self.forum_url(&format!("/api/posts/{id}")));
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn create_post(&self, input: &NewPost) -> Result<Post, Error> {
        let builder = self
            .gateway
            .http()
            .post(self.forum_url("/api/posts"))
            .json(input);
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn update_post(&self, id: i64, patch: &PostPatch) -> Result<Post, Error> {
        let builder = self
            .gateway
            .http()
            .put(self.forum_url(&format!("/api/posts/{id}")))
            .json(patch);
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn delete_post(&self, id: i64) -> Result<(), Error> {
        let builder = self
            .gateway
            .http()
            .delete(self.forum_url(&format!("/api/posts/{id}")));
        expect_success(self.gateway.send(builder).await?).await
    }

    pub async fn replies(&self, post_id: i64) -> Result<Vec<Reply>, Error> {
        let builder = self
            .gateway
            .http()
            .get(self.forum_url(&format!("/api/posts/{post_id}/replies")));
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn create_reply(&self, post_id: i64, input: &NewReply) -> Result<Reply, Error> {
        let builder = self
            .gateway
            .http()
            .post(self.forum_url(&format!("/api/posts/{post_id}/replies")))
            .json(input);
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn forum_stats(&self) -> Result<ForumStats, Error> {
        let builder = self.gateway.http().get(self.forum_url("/api/stats"));
        decode(self.gateway.send(builder).await?).await
    }

    // ── Chat history ──

    /// Most recent messages, oldest first. `before_id` pages backwards.
    pub async fn chat_history(
        &self,
        limit: u32,
        before_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>, Error> {
        let mut builder = self
            .gateway
            .http()
            .get(self.chat_url("/api/chat/messages"))
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before_id {
            builder = builder.query(&[("before_id", before)]);
        }
        decode(self.gateway.send(builder).await?).await
    }

    // ── Admin ──

    pub async fn admin_users(&self) -> Result<Vec<User>, Error> {
        let builder = self.gateway.http().get(self.auth_url("/admin/users"));
        decode(self.gateway.send(builder).await?).await
    }

    pub async fn set_user_role(&self, user_id: i64, is_admin: bool) -> Result<(), Error> {
        let builder = self
            .gateway
            .http()
            .put(self.auth_url(&format!("/api/users/{user_id}/role")))
            .json(&serde_json::json!({ "is_admin": is_admin }));
        expect_success(self.gateway.send(builder).await?).await
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<(), Error> {
        let builder = self
            .gateway
            .http()
            .delete(self.auth_url(&format!("/admin/users/{user_id}")));
        expect_success(self.gateway.send(builder).await?).await
    }

    pub async fn admin_stats(&self) -> Result<AdminStats, Error> {
        let builder = self.gateway.http().get(self.auth_url("/admin/stats"));
        decode(self.gateway.send(builder).await?).await
    }
}

/// Decode a success body, or surface the status and body text as an error.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    let status = response.status();
    if status.is_success() {
        Ok(response.json::<T>().await?)
    } else {
        let message = response.text().await.unwrap_or_default();
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

async fn expect_success(response: reqwest::Response) -> Result<(), Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}
