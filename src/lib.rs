pub mod config;
pub mod error;
pub mod lsn;
pub mod memory;
pub mod postgres;
pub mod replicator;
pub mod sink;
pub mod source;
pub mod stream;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use lsn::Lsn;
pub use memory::MemorySource;
pub use postgres::PgSource;
pub use replicator::{Replicator, ReplicatorState};
pub use sink::{ChannelSink, LogSink, RecordSink};
pub use source::{ReplicationSource, ReplicationStream};
pub use stream::StreamReader;
pub use types::{ChangeRecord, FetchStatus, StreamSummary};
