//! Region assignment
//!
//! - Region model and per-region state nodes (`region`)
//! - Node liveness registry (`node`) and placement policy (`placement`)
//! - Durable region-state table (`region_store`)
//! - Batched open/close dispatch to storage nodes (`dispatcher`)
//! - Assign / Unassign / Move procedures (`transit`) and crash recovery (`crash`)
//! - The [`AssignmentManager`] facade (`manager`)

pub mod crash;
pub mod dispatcher;
pub mod manager;
pub mod node;
pub mod placement;
pub mod region;
pub mod region_store;
pub mod transit;

pub use crash::ServerCrashProcedure;
pub use dispatcher::{
    CloseRegionRequest, CloseResult, DispatchListener, DispatchOutcome, ExecuteRequest,
    ExecuteResponse, OpenRegionRequest, OpenResult, RegionServerTransport, RemoteDispatcher,
    RemoteOperation, TransportError,
};
pub use manager::{AssignmentContext, AssignmentManager, AssignmentServices, MasterEnv};
pub use node::{InMemoryNodeRegistry, NodeRegistry};
pub use placement::{hrw_rank, HrwPlacement, PlacementPolicy};
pub use region::{
    LockKind, RegionInfo, RegionNodeRef, RegionSignal, RegionState, RegionStateNode, ServerName,
    TransitionCode, TransitionReport,
};
pub use region_store::{
    FileRegionStateStore, MemoryRegionStateStore, RegionRecord, RegionStateStore,
};
pub use transit::{AssignProcedure, MasterProcedure, MoveRegionProcedure, UnassignProcedure};
