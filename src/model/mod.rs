mod backup;
mod connection;
mod destination;

pub use backup::*;
pub use connection::*;
pub use destination::*;

pub type ConnectionId = i64;
pub type TargetId = i64;
pub type BackupId = i64;
pub type DestinationId = i64;
