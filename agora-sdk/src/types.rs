//! Domain types shared by the REST surface and the chat stream.
//!
//! Field names mirror the wire contracts of the auth, forum, and chat
//! services (snake_case JSON, RFC 3339 timestamps).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A forum post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    /// Populated when the server joins author info into the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reply under a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: i64,
    pub post_id: i64,
    pub content: String,
    pub author_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a post.
#[derive(Debug, Clone, Serialize)]
pub struct NewPost {
    pub title: String,
    pub content: String,
}

/// Partial update for an existing post. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Input for creating a reply.
#[derive(Debug, Clone, Serialize)]
pub struct NewReply {
    pub content: String,
}

/// Partial update for the signed-in account.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A message delivered over the chat stream or the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Forum-wide counters shown on the admin panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumStats {
    pub total_posts: i64,
    pub total_replies: i64,
    pub active_threads: i64,
    pub users_posted: i64,
}

/// Account/session counters shown on the admin panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminStats {
    pub total_users: i64,
    pub active_users: i64,
    pub total_sessions: i64,
}
