//! Client-side reliability and orchestration for tag-driven stations.
//!
//! This crate turns a [`TagBackend`](cellink_api::TagBackend) into
//! dependable device behavior:
//!
//! - **[`AsyncOperation`]**: one-shot result of every non-blocking call,
//!   awaitable or observed through a continuation that fires exactly once.
//!
//! - **[`TransportClient`]**: actor owning the session, the node cache and
//!   the subscription table. Exposes connect/disconnect, single and batched
//!   reads/writes, and change notification kept alive by a fixed-tick
//!   reconciliation loop.
//!
//! - **[`execute_command`]**: the three-phase command protocol: check the
//!   status fields, pre-write and mirror local state, then send.
//!
//! - **[`fsm`]**: a small hierarchical state-machine interpreter whose
//!   timers and activities belong to the state that started them.
//!
//! - **[`Station`]** / **[`RunCycle`]**: the per-station facade with its
//!   data-request and upload cycles, and the pick/place run cycle with
//!   fault recovery. Both publish [`StationEvent`]s on an [`EventBus`].
//!
//! - **[`DeviceState`]**: lock-free mirror of the monitored device fields,
//!   readable from any thread.

pub mod client;
pub mod codes;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod fsm;
pub mod model;
pub mod operation;
pub mod orchestrator;
pub mod state;
pub mod tags;
pub mod worker;

#[cfg(test)]
mod test_support;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{ConnectionState, TagChange, TagWatch, TagWrite, TransportClient};
pub use command::{CommandSpec, execute_command};
pub use config::{ClientConfig, MonitoringConfig, PollIntervals, RunMode, StationConfig};
pub use error::CoreError;
pub use event::{EventBus, EventResult, StationEvent};
pub use model::{Direction, ToolingData, ToolingIdentifier};
pub use operation::{AsyncOperation, Outcome};
pub use orchestrator::{
    RequireDataEvent, RequireDataState, RunCycle, RunEvent, RunState, Station, UploadEvent,
    UploadState,
};
pub use state::{DeviceSnapshot, DeviceState};
pub use tags::{RequireDataTags, TagMap, TransferTags, UploadTags};
