// ── Command protocol ──
//
// Three strictly ordered phases against one station field set:
//
//   [check state]                             batch-read the precondition
//                                             fields, every one must be a
//                                             u16 that satisfies its check
//   [set values before send execute command]  batch-write the pre-writes,
//                                             then run the local-state hook
//   [send execute command]                    write the command value
//
// The hook runs after the pre-writes are acknowledged and before the
// command write is dispatched, so a local mirror never lags the device.

use std::fmt;
use std::sync::Arc;

use cellink_api::{ValueType, Variant};
use tracing::{debug, warn};

use crate::client::{TagWrite, TransportClient};
use crate::codes::ExecuteState;
use crate::error::CoreError;

pub(crate) const CHECK_PHASE: &str = "[check state]";
pub(crate) const PREPARE_PHASE: &str = "[set values before send execute command]";
pub(crate) const SEND_PHASE: &str = "[send execute command]";

type Predicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;

#[derive(Clone)]
struct Precondition {
    field: String,
    accept: Predicate,
}

/// Immutable description of one command invocation.
#[derive(Clone)]
pub struct CommandSpec {
    prefix: String,
    checks: Vec<Precondition>,
    pre_writes: Vec<TagWrite>,
    command: TagWrite,
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("prefix", &self.prefix)
            .field(
                "checks",
                &self.checks.iter().map(|c| c.field.as_str()).collect::<Vec<_>>(),
            )
            .field("pre_writes", &self.pre_writes)
            .field("command", &self.command)
            .finish()
    }
}

impl CommandSpec {
    /// A command writing `value` (as `UInt16`) to `command_field`.
    ///
    /// `prefix` heads every phase tag, e.g. `"[init]"`.
    pub fn new(prefix: impl Into<String>, command_field: &str, value: impl Into<u16>) -> Self {
        Self {
            prefix: prefix.into(),
            checks: Vec::new(),
            pre_writes: Vec::new(),
            command: TagWrite::new(command_field, ValueType::UInt16, Variant::UInt16(value.into())),
        }
    }

    /// The common shape: `status_field` must be NOT_EXECUTE or FINISHED,
    /// is reset to NOT_EXECUTE, then the command is sent.
    pub fn execute(
        prefix: impl Into<String>,
        status_field: &str,
        command_field: &str,
        value: impl Into<u16>,
    ) -> Self {
        Self::new(prefix, command_field, value)
            .check_any(status_field, &[ExecuteState::NotExecute, ExecuteState::Finished])
            .pre_write(TagWrite::u16(status_field, ExecuteState::NotExecute))
    }

    /// Require `field` to satisfy `accept` before anything is written.
    #[must_use]
    pub fn check(mut self, field: &str, accept: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.checks.push(Precondition {
            field: field.to_owned(),
            accept: Arc::new(accept),
        });
        self
    }

    /// Require `field` to hold one of `allowed`.
    #[must_use]
    pub fn check_any<C: Into<u16> + Copy>(self, field: &str, allowed: &[C]) -> Self {
        let allowed: Vec<u16> = allowed.iter().map(|c| (*c).into()).collect();
        self.check(field, move |v| allowed.contains(&v))
    }

    #[must_use]
    pub fn pre_write(mut self, write: TagWrite) -> Self {
        self.pre_writes.push(write);
        self
    }

    pub fn command_field(&self) -> &str {
        &self.command.tag
    }

    fn phase(&self, phase: &str) -> String {
        format!("{}{phase}", self.prefix)
    }
}

/// Run the three phases of `spec` in order.
///
/// `on_update_local_state` runs exactly once, between a successful
/// pre-write and the command write, and only when there are pre-writes.
pub async fn execute_command<F>(
    client: &TransportClient,
    spec: &CommandSpec,
    on_update_local_state: F,
) -> Result<(), CoreError>
where
    F: FnOnce(),
{
    let outcome = run_phases(client, spec, on_update_local_state).await;
    match &outcome {
        Ok(()) => debug!(command = %spec.command.tag, prefix = %spec.prefix, "command sent"),
        Err(e) => warn!(
            field = e.field().unwrap_or_default(),
            error = %e,
            "command failed"
        ),
    }
    outcome
}

async fn run_phases<F>(
    client: &TransportClient,
    spec: &CommandSpec,
    on_update_local_state: F,
) -> Result<(), CoreError>
where
    F: FnOnce(),
{
    if !spec.checks.is_empty() {
        check_state(client, spec).await?;
    }

    if let Some(first) = spec.pre_writes.first() {
        client
            .write_tags(spec.pre_writes.clone())
            .await
            .map_err(|e| e.in_phase(&spec.phase(PREPARE_PHASE), &first.tag))?;
        on_update_local_state();
    }

    let command = &spec.command;
    client
        .write_tag(&command.tag, command.value.clone(), command.value_type)
        .await
        .map_err(|e| e.in_phase(&spec.phase(SEND_PHASE), &command.tag))
}

async fn check_state(client: &TransportClient, spec: &CommandSpec) -> Result<(), CoreError> {
    let phase = spec.phase(CHECK_PHASE);
    let fields: Vec<&str> = spec.checks.iter().map(|c| c.field.as_str()).collect();
    let values = client
        .read_tags(&fields)
        .await
        .map_err(|e| e.in_phase(&phase, fields.first().copied().unwrap_or_default()))?;

    for check in &spec.checks {
        let field = check.field.as_str();
        let value = values.get(field).ok_or_else(|| {
            CoreError::validation(field, format!("Read field does not find ! - {field}"))
                .in_phase(&phase, field)
        })?;
        let code = value.as_u16().ok_or_else(|| {
            CoreError::validation(field, format!("Read node variable type is not right ! - {field}"))
                .in_phase(&phase, field)
        })?;
        if !(check.accept)(code) {
            return Err(CoreError::validation(field, format!("{field} = {code}")).in_phase(&phase, field));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cellink_api::StatusCode;
    use cellink_api::sim::WriteRecord;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codes::SendCommand;
    use crate::test_support::connected;

    fn init_spec() -> CommandSpec {
        CommandSpec::execute("[init]", "InitExecuteState", "InitCommand", SendCommand::NeedExecute)
    }

    #[tokio::test]
    async fn phases_run_in_order_and_hook_precedes_command() {
        let (sim, client) = connected().await;
        sim.set_value("InitExecuteState", ExecuteState::Finished.code());
        sim.set_value("InitCommand", SendCommand::NotExecute.code());

        let writes_at_hook = Arc::new(AtomicUsize::new(usize::MAX));
        let probe = sim.clone();
        let seen = writes_at_hook.clone();
        execute_command(&client, &init_spec(), move || {
            seen.store(probe.writes().len(), Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert_eq!(
            sim.writes(),
            vec![
                WriteRecord {
                    tag: "InitExecuteState".into(),
                    value: Variant::UInt16(0),
                },
                WriteRecord {
                    tag: "InitCommand".into(),
                    value: Variant::UInt16(1),
                },
            ]
        );
        assert_eq!(writes_at_hook.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_precondition_names_field_and_value() {
        let (sim, client) = connected().await;
        sim.set_value("InitExecuteState", ExecuteState::Executing.code());
        sim.set_value("InitCommand", SendCommand::NotExecute.code());

        let err = execute_command(&client, &init_spec(), || {}).await.unwrap_err();
        assert_eq!(err.to_string(), "[init][check state] InitExecuteState = 1");
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn wrong_type_fails_the_check_phase() {
        let (sim, client) = connected().await;
        sim.set_value("InitExecuteState", Variant::String("idle".into()));

        let err = execute_command(&client, &init_spec(), || {}).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("Read node variable type is not right ! - InitExecuteState"));
    }

    #[tokio::test]
    async fn failed_pre_write_skips_hook_and_command() {
        let (sim, client) = connected().await;
        sim.set_value("InitExecuteState", ExecuteState::NotExecute.code());
        sim.set_value("InitCommand", SendCommand::NotExecute.code());
        sim.fail_writes("InitExecuteState", StatusCode::BAD_NOT_WRITABLE);

        let hooked = Arc::new(AtomicUsize::new(0));
        let counter = hooked.clone();
        let err = execute_command(&client, &init_spec(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

        assert!(err.to_string().starts_with("[init][set values before send execute command]"));
        assert_eq!(hooked.load(Ordering::SeqCst), 0);
        assert!(sim.writes_to(&["InitCommand"]).is_empty());
    }

    #[tokio::test]
    async fn command_failure_is_tagged_with_send_phase() {
        let (sim, client) = connected().await;
        sim.set_value("InitExecuteState", ExecuteState::NotExecute.code());
        sim.set_value("InitCommand", SendCommand::NotExecute.code());
        sim.fail_writes("InitCommand", StatusCode::BAD_NOT_WRITABLE);

        let err = execute_command(&client, &init_spec(), || {}).await.unwrap_err();
        assert_eq!(err.field(), Some("InitCommand"));
        assert!(err.to_string().starts_with("[init][send execute command]"));
    }
}
