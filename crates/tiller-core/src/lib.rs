pub mod agent_loop;
pub mod approvals;
pub mod run_registry;
pub mod session_store;

pub use agent_loop::*;
pub use approvals::*;
pub use run_registry::*;
pub use session_store::*;
