/*!
NEMO BRIDGE

Consumes per-tool usage events from the facility backend broker, keeps the
latest status of every tool, and republishes a trimmed view for the
per-tool display nodes plus facility-wide counts and a bridge heartbeat.

ingest broker -> connection -> ingest -> store -> publisher / aggregator -> display broker
*/

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod ingest;
pub mod mapping;
pub mod models;
pub mod normalize;
pub mod publisher;
pub mod store;
pub mod topics;

pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError, IngestError, MappingError};
pub use mapping::{MappingSource, ToolMappingTable};
pub use store::StatusStore;
pub use topics::Topics;
