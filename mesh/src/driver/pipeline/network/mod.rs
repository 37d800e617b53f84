pub mod authentication;
pub mod network_message_cache;

pub use authentication::Authentication;
pub use network_message_cache::NetworkMessageCache;
