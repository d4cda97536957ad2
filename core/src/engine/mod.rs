//! Everything that talks to the external monitoring engine: the framed
//! pipe protocol, one-shot tool invocations, and the process supervisor.

pub mod pipe;
pub mod supervisor;
pub mod tool;

pub use pipe::{EngineResponse, SentinelFramed};
pub use supervisor::{EngineState, EngineSupervisor, LaunchOutcome, LaunchSpec, StopOutcome};
pub use tool::{EngineCli, EngineTool};
