pub mod cache;
pub mod config;
pub mod disk_usage;
pub mod engine;
pub mod exception;
pub mod meta;
pub mod naming;
pub mod origin;
pub mod param;
pub mod passthrough;
pub mod request;
pub mod response;
pub mod server;
pub mod source;
pub mod streaming;
pub mod util;

pub use cache::FileCache;
pub use config::{Config, ReconnectPolicy};
pub use engine::{Engine, EngineBuilder, ProxyRequest};
pub use exception::Exception;
pub use meta::{MediaMeta, MetaStore};
pub use request::GetRequest;
pub use response::ResponseHeader;
pub use server::ProxyServer;
pub use streaming::CacheCallback;
