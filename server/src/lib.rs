//! Pool orchestrator: owns the job registry and the live-session set, wires
//! external collaborators, and runs the TCP accept loop that the protocol
//! engine itself treats as an out-of-process concern.

pub mod orchestrator;
pub mod stores;
pub mod template_source;

pub use orchestrator::{OrchestratorConfig, PoolOrchestrator};
pub use stores::{
    HttpBitcoinRpc, MemoryAddressSettingsStore, MemoryBlockStore, MemoryClientStore, MemoryStatisticsStore,
    RejectingBitcoinRpc,
};
pub use template_source::{HttpTemplatePoller, StaticTemplatePoller};
