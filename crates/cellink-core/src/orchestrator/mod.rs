//! Station orchestration.
//!
//! - **[`Station`]** is the control facade: connection, the command
//!   protocol on every station field set, and the two device-initiated
//!   data cycles that run alongside everything else.
//! - **[`RunCycle`]** drives complete pick/place transfers on top of a
//!   station whose client lives on its own worker thread, with fault
//!   recovery through reconnect and re-initialization.
//!
//! Every machine turns failed reads and writes into an `ExistError`
//! event. Nothing here unwinds on a device error.

mod require_data;
mod run_cycle;
mod station;
mod upload;

use indexmap::IndexMap;
use tracing::warn;

use cellink_api::Variant;

use crate::error::CoreError;
use crate::fsm::EventId;

pub use require_data::{RequireDataEvent, RequireDataState};
pub use run_cycle::{RunCycle, RunEvent, RunState};
pub use station::Station;
pub use upload::{UploadEvent, UploadState};

/// Next event after a cycle step: `ok` on success, `fail` after logging the error.
fn advance<E: EventId>(
    machine: &'static str,
    step: &'static str,
    result: Result<(), CoreError>,
    ok: E,
    fail: E,
) -> Option<E> {
    match result {
        Ok(()) => Some(ok),
        Err(e) => {
            warn!(
                machine,
                step,
                field = e.field().unwrap_or_default(),
                error = %e,
                "cycle step failed"
            );
            Some(fail)
        }
    }
}

/// Typed value of `field` in a batch read.
fn decode<T>(
    values: &IndexMap<String, Variant>,
    field: &str,
    convert: impl FnOnce(&Variant) -> Option<T>,
) -> Result<T, CoreError> {
    let value = values.get(field).ok_or_else(|| {
        CoreError::validation(field, format!("Read field does not find ! - {field}"))
    })?;
    convert(value).ok_or_else(|| {
        CoreError::validation(field, format!("Read node variable type is not right ! - {field}"))
    })
}
