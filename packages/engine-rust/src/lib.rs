//! `OfficeFloor` Engine: managed objects, governance, teams, and the thread
//! and process states that run functions across them.

pub mod config;
mod execute;
pub mod floor;
pub mod function;
pub mod governance;
pub mod managed_object;
pub mod management;
pub mod monitor;
pub mod office;
pub mod shutdown;
pub mod team;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use execute::{
    ProcessEscalationHandler, ProcessOutcome, ProcessReport, ThreadStatus, ThreadSummary,
};
pub use floor::{CloseReport, InvokeError, OfficeFloor, OpenError, ProcessHandle};
pub use function::{FunctionContext, FunctionType, ManagedFunction};
pub use office::SourceRegistry;

