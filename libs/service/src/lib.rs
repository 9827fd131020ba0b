#![forbid(unsafe_code)]
#![warn(clippy::default_trait_access)]

mod auth;
mod config;
mod director;
mod error;
mod filter;
mod interceptor;
mod matcher;
mod message;
mod metrics;
mod publisher;
mod registry;
mod session;
mod state;
mod store;
mod topic_tree;

pub use auth::{AcceptAllAuthenticator, Authenticator, Authorizator, PermitAllAuthorizator};
pub use config::BrokerConfig;
pub use director::{client_loop, RemoteAddr};
pub use error::Error;
pub use filter::{valid_topic, TopicFilter};
pub use interceptor::{BrokerEvent, Interceptor, InterceptorBus};
pub use matcher::TopicMatcher;
pub use message::{Message, WillMessage};
pub use metrics::MetricsSnapshot;
pub use registry::{ConnectionDescriptor, ConnectionRegistry, ConnectionState};
pub use session::{ClientSession, InflightMessage, MemorySessionStore, SessionStore};
pub use state::BrokerState;
pub use store::{MemoryMessageStore, MessageStore};
