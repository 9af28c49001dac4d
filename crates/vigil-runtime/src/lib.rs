//! # vigil-runtime
//!
//! The task orchestration and streaming engine: lifecycle controller,
//! phase state machine with model-informed routing, durable+live event
//! pipeline, and the cooperative cancellation protocol tying them
//! together.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `controller` | `submit`/`cancel`/`status`, supervision, terminal commit |
//! | `machine` | Phase state machine with the non-termination guard |
//! | `router` | Model routing hint validation + deterministic fallback |
//! | `pipeline` | Sequence assignment, persist-then-fan-out, live streams |
//! | `cancel` | Task-id-keyed cooperative cancellation registry |
//! | `workspace` | Archive/repository acquisition fallback chain |
//! | `workers` | Worker contracts and the execution-node arena |
//! | `tools` | Opaque tool registry and the instrumented call envelope |

#![deny(unsafe_code)]

pub mod cancel;
pub mod controller;
pub mod errors;
pub mod machine;
pub mod pipeline;
pub mod router;
pub mod tools;
pub mod workers;
pub mod workspace;

pub use cancel::CancelRegistry;
pub use controller::{StatusSnapshot, SubmitRequest, TaskController};
pub use errors::{Result, RuntimeError};
pub use machine::{MachineReport, PhaseMachine, TaskContext};
pub use pipeline::stream::StreamItem;
pub use pipeline::{EventPipeline, SubscriberRegistry};
pub use router::{PhaseAction, RouterClient, RouterDecision, RouterError, StateSummary};
pub use workers::{
    ExecutionNode, NodeCounters, NodeRole, PhaseWorker, WorkerArena, WorkerError, WorkerFactory,
    WorkerInput, WorkerOutput,
};
pub use workspace::{AcquireError, Acquirer, Workspace, WorkspaceProvider};
