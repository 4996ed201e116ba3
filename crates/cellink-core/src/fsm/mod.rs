//! Hierarchical state machine interpreter.
//!
//! A [`Chart`] is the static structure: state ids with parent links, the
//! initial child of each composite state, terminal states, and a
//! transition table keyed by `(state, event)`. A [`MachineHandle`] runs a
//! chart together with a [`Behavior`] that supplies the entry and exit
//! hooks. Polling timers and background activities started from a hook
//! belong to the state that started them and stop when it is left.

mod chart;
mod runtime;

pub use chart::{Chart, ChartBuilder, ChartError, EventId, StateId, Step};
pub use runtime::{Behavior, Context, EventSender, MachineHandle, MachineStatus};
