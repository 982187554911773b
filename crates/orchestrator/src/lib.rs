//! The Turn Orchestrator (§4.D) and Command Router (§4.E): the agent's
//! central state machine.

pub mod command_router;
pub mod turn;

pub use command_router::{route_command, CommandOutcome};
pub use turn::{OrchestratorError, ProcessOptions, TurnOrchestrator, TurnOutcome};
