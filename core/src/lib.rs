pub mod auth;
pub mod config;
pub mod conversations;
pub mod credentials;
pub mod crypto;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod extract;
pub mod messages;
pub mod models;
pub mod rate_limiter;
pub mod sanitizer;
pub mod schema;
pub mod seed;
pub mod session_store;
pub mod upstream;

pub use auth::AuthGateway;
pub use config::AppConfig;
pub use conversations::{find_conversations, ConversationRetriever};
pub use error::{CoreError, UpstreamError, UpstreamErrorKind};
pub use messages::{sort_by_timestamp, MessageRetriever};
pub use rate_limiter::RateLimiter;
pub use upstream::InstagramApi;
