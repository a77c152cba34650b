//! PageRelay: correlation broker and paginated multi-target aggregation over duplex worker connections.

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod materialize;
pub mod orchestrator;
pub mod owner;
pub mod pagination;
pub mod protocol;
pub mod records;
pub mod registry;
pub mod session;
pub mod types;

pub use broker::Broker;
pub use config::{QueryProfile, QueryProfiles, RelayConfig};
pub use error::{CallError, RelayError, RelayResult};
pub use events::{EventBus, RelayEvent};
pub use ledger::{DedupLedger, FileLedger, LedgerEntry, MemoryLedger};
pub use materialize::{MaterializeSummary, Materializer};
pub use orchestrator::{parse_targets, Orchestrator, ReportRow, RunReport, RunRequest};
pub use owner::{owner_from_url, OwnerRules, UNKNOWN_OWNER};
pub use pagination::{AggregationResult, BrokerPageSource, PageSource, Paginator, Termination};
pub use protocol::{ServerMessage, WorkerMessage};
pub use records::{RecordLog, RunStore};
pub use registry::{ConnectionRegistry, WorkerConnection};
pub use session::{SessionAction, WorkerSession};
pub use types::*;
