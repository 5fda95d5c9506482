pub mod paths;
pub mod state;
pub mod store;

pub use state::{AgentState, RecoveredExecutor, RecoveredFramework, RecoveredRun, RecoveredTask};
pub use store::UpdateLogRecord;
