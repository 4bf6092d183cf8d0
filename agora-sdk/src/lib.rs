//! Client SDK for the agora forum and chat services.
//!
//! The SDK owns the two stateful mechanisms every consumer needs and should
//! never reimplement:
//!
//! - the **request gateway** ([`gateway::Gateway`]): attaches the bearer
//!   token to every REST call, and on a 401 performs at most one concurrent
//!   token refresh, parking and replaying the requests that raced it;
//! - the **chat connection** ([`stream::ChatConnection`]): a single logical
//!   WebSocket kept alive with bounded exponential backoff, authenticated by
//!   query token on every attempt, delivering messages in transport order.
//!
//! Both share one injected [`credentials::CredentialStore`] and are otherwise
//! independent. The typed REST surface lives in [`api::ApiClient`].
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), agora_sdk::Error> {
//! use std::sync::Arc;
//! use agora_sdk::{ApiClient, ChatConnection, CredentialStore, ServiceUrls, StreamConfig};
//!
//! let store = Arc::new(CredentialStore::in_memory());
//! let api = ApiClient::new(ServiceUrls::single_origin("http://localhost:8081"), Arc::clone(&store));
//! api.sign_in("alice@example.com", "hunter22").await?;
//!
//! let chat = ChatConnection::new(StreamConfig::default(), store);
//! let mut events = chat.connect().expect("fresh connection");
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod credentials;
pub mod error;
pub mod event;
pub mod gateway;
pub mod stream;
pub mod types;

pub use api::{ApiClient, ServiceUrls};
pub use credentials::{CredentialStore, TokenPair};
pub use error::Error;
pub use event::StreamEvent;
pub use gateway::Gateway;
pub use stream::{ChatConnection, ConnectionState, Identity, StreamConfig};
