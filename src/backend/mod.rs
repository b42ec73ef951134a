mod connection;
mod link;
mod target;

pub use connection::{BackendConnection, ConnectionError};
pub use link::{BackendEvent, BackendLink, ReplyChunk, Request, SpawnedLink};
pub use target::{Target, TargetRef, TargetSet};
