pub mod connection;
pub mod protocol;
pub mod slot;
pub mod source;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{QueryRow, ReplicationConnection};
pub use protocol::CopyBothMessage;
pub use source::{PgSource, PgStream};
