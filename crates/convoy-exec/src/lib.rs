//! convoy-exec - scheduling, platform operators, status tracking and run state

pub mod command;
pub mod error;
pub mod executor;
pub mod mock;
pub mod operation;
pub mod plan;
pub mod state;
pub mod store;
pub mod tracker;

pub use command::CommandOperator;
pub use error::{ExecError, Result, TrackerError};
pub use executor::Executor;
pub use mock::{MockBehavior, MockCall, MockOperator};
pub use operation::{OperationRequest, OperationResult, PlatformOperator};
pub use plan::{ChangeKind, ChangePlan, Decision, PlannedChange};
pub use state::{AppliedState, NodeRecord, RunResult};
pub use store::{LocalFsStore, StateStore};
pub use tracker::{RunEvent, StatusTracker, Transition};
