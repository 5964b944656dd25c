//! Harvest engine: OAI-PMH protocol client, metadata store contract and the
//! orchestrator of one harvesting run.
mod decode;
mod engine;
mod fetch;
mod harvester;
mod memory;
mod parse;
mod protocol;
mod services;
mod store;
mod transform;
mod types;
mod worker;

pub use decode::{decode_xml, DecodeError, DecodedXml};
pub use engine::{WorkerError, WorkerHandle};
pub use fetch::{FetchSettings, PageFetcher, ReqwestFetcher};
pub use harvester::{HarvestListener, HarvestRequest, Harvester, ListenerError, OaiHarvester};
pub use memory::{MemoryRunLog, MemoryStore};
pub use parse::{
    parse_response, MetadataNode, OaiResponse, OaiSet, ProtocolError, RawRecord,
    RepositoryIdentity,
};
pub use protocol::{OaiErrorCode, OaiRequest};
pub use services::{
    Prevalidator, PrevalidatorFactory, RunLog, RunLogEntry, RunLogLevel, ValidationError,
};
pub use store::{sha256_hex, SnapshotStore, StoreError, StoreTransaction, StoredRecord};
pub use transform::{FormatTransformer, TransformError, TransformParams};
pub use types::{FaultClass, FaultKind, FetchMetadata, FetchOutput, OaiError};
pub use worker::{HarvestingWorker, WorkerSettings, INITIALIZING};
