pub mod events;
pub mod ingest;
pub mod preflight;
pub mod transactions;
pub mod window;

pub use events::{
    EventCursor, EventFilter, EventIndex, EventPage, EventQuery, EventRecord, SegmentFilter,
    TopicFilter,
};
pub use ingest::{
    IngestionCursor, IngestionHandle, IngestionHealth, IngestionPipeline, LedgerInfo,
    PipelineState,
};
pub use preflight::{
    SimulationJob, SimulationResult, SimulationTicket, SimulationWorkerPool, Simulator,
    WorkerPoolState,
};
pub use transactions::{TransactionIndex, TransactionLookup, TransactionRecord};
pub use window::{LedgerBucket, RetentionWindow, WindowRange};
