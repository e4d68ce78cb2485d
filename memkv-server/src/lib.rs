//! Node runtime: consensus actor, peer transports and the HTTP facade.

pub mod actor;
pub mod http;
pub mod transport;

pub use actor::{spawn_node, ActorConfig, NodeHandle};
pub use http::router;
pub use transport::{HttpTransport, LocalRouter, Transport};
