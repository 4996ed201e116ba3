// ── Device-state snapshot ──
//
// Mirror of the monitored station fields, written by the station's
// mirror task and read from any thread. Each field is independent:
// scalar codes are atomics, timestamps are swapped whole. No
// cross-field consistency is implied.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::client::ConnectionState;
use crate::codes::{ExecuteState, PlanRespond, ReadyState, RequireState, ToolingPresence, WorkAreaState};
use crate::model::Direction;
use crate::tags::TagMap;

/// Stored in place of a code that has not been observed yet.
const UNKNOWN: u32 = u32::MAX;

#[derive(Debug)]
pub struct DeviceState {
    tags: TagMap,
    fields: IndexMap<String, AtomicU32>,
    connection: AtomicU8,
    work_started_at: ArcSwapOption<DateTime<Utc>>,
    ready_in_at: ArcSwapOption<DateTime<Utc>>,
    ready_out_at: ArcSwapOption<DateTime<Utc>>,
}

/// Point-in-time copy of a [`DeviceState`], for display and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub connection: ConnectionState,
    pub fields: IndexMap<String, Option<u16>>,
    pub work_started_at: Option<DateTime<Utc>>,
    pub ready_in_at: Option<DateTime<Utc>>,
    pub ready_out_at: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Snapshot over the monitored fields of `tags`, all unknown.
    pub fn new(tags: TagMap) -> Self {
        let fields = tags
            .monitored()
            .into_iter()
            .map(|f| (f.to_owned(), AtomicU32::new(UNKNOWN)))
            .collect();
        Self {
            tags,
            fields,
            connection: AtomicU8::new(ConnectionState::Disconnected as u8),
            work_started_at: ArcSwapOption::empty(),
            ready_in_at: ArcSwapOption::empty(),
            ready_out_at: ArcSwapOption::empty(),
        }
    }

    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    /// Whether `field` is mirrored here.
    pub fn tracks(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Last observed code of `field`.
    pub fn get(&self, field: &str) -> Option<u16> {
        let raw = self.fields.get(field)?.load(Ordering::Acquire);
        u16::try_from(raw).ok()
    }

    /// Store `value`. Returns `true` when it differs from the previous one.
    /// Fields that are not mirrored are ignored.
    pub fn set(&self, field: &str, value: u16) -> bool {
        self.fields
            .get(field)
            .is_some_and(|slot| slot.swap(u32::from(value), Ordering::AcqRel) != u32::from(value))
    }

    /// Store a notified value and record the derived timestamps.
    pub fn apply(&self, field: &str, value: u16) -> bool {
        let changed = self.set(field, value);
        if !changed {
            return changed;
        }
        let now = Some(Arc::new(Utc::now()));
        if field == self.tags.work_area_state && value == WorkAreaState::Working.code() {
            self.work_started_at.store(now);
        } else if field == self.tags.receive.ready && value == ReadyState::HasReady.code() {
            self.ready_in_at.store(now);
        } else if field == self.tags.send.ready && value == ReadyState::HasReady.code() {
            self.ready_out_at.store(now);
        }
        changed
    }

    /// Forget every observed code, e.g. after the session went away.
    pub fn invalidate(&self) {
        for slot in self.fields.values() {
            slot.store(UNKNOWN, Ordering::Release);
        }
    }

    // ── Connection ──────────────────────────────────────────────────

    pub fn connection(&self) -> ConnectionState {
        ConnectionState::from_repr(self.connection.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.connection.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connection() == ConnectionState::Connected
    }

    // ── Typed accessors ─────────────────────────────────────────────

    pub fn init_execute_state(&self) -> Option<ExecuteState> {
        self.get(&self.tags.init_execute_state).and_then(ExecuteState::from_code)
    }

    pub fn set_init_execute_state(&self, state: ExecuteState) {
        let field = self.tags.init_execute_state.clone();
        self.set(&field, state.code());
    }

    pub fn plan_respond(&self, direction: Direction) -> Option<PlanRespond> {
        self.get(&self.tags.transfer(direction).plan_respond)
            .and_then(PlanRespond::from_code)
    }

    pub fn execute_state(&self, direction: Direction) -> Option<ExecuteState> {
        self.get(&self.tags.transfer(direction).execute_state)
            .and_then(ExecuteState::from_code)
    }

    pub fn ready(&self, direction: Direction) -> Option<ReadyState> {
        self.get(&self.tags.transfer(direction).ready)
            .and_then(ReadyState::from_code)
    }

    pub fn device_state(&self) -> Option<u16> {
        self.get(&self.tags.device_state)
    }

    pub fn work_area_state(&self) -> Option<WorkAreaState> {
        self.get(&self.tags.work_area_state).and_then(WorkAreaState::from_code)
    }

    pub fn work_area_tooling(&self) -> Option<ToolingPresence> {
        self.get(&self.tags.work_area_tooling)
            .and_then(ToolingPresence::from_code)
    }

    pub fn show_main_ui(&self) -> Option<bool> {
        self.get(&self.tags.show_main_ui).map(|v| v != 0)
    }

    pub fn require_data_request(&self) -> Option<RequireState> {
        self.get(&self.tags.require_data.request)
            .and_then(RequireState::from_code)
    }

    pub fn set_require_data_request(&self, state: RequireState) {
        let field = self.tags.require_data.request.clone();
        self.set(&field, state.code());
    }

    pub fn upload_request(&self) -> Option<RequireState> {
        self.get(&self.tags.upload.request).and_then(RequireState::from_code)
    }

    pub fn set_upload_request(&self, state: RequireState) {
        let field = self.tags.upload.request.clone();
        self.set(&field, state.code());
    }

    // ── Timestamps ──────────────────────────────────────────────────

    /// When the work area last started working.
    pub fn work_started_at(&self) -> Option<DateTime<Utc>> {
        self.work_started_at.load_full().map(|t| *t)
    }

    /// When the station last became ready to receive.
    pub fn ready_in_at(&self) -> Option<DateTime<Utc>> {
        self.ready_in_at.load_full().map(|t| *t)
    }

    /// When the station last became ready to send.
    pub fn ready_out_at(&self) -> Option<DateTime<Utc>> {
        self.ready_out_at.load_full().map(|t| *t)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            connection: self.connection(),
            fields: self
                .fields
                .keys()
                .map(|f| (f.clone(), self.get(f)))
                .collect(),
            work_started_at: self.work_started_at(),
            ready_in_at: self.ready_in_at(),
            ready_out_at: self.ready_out_at(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn unknown_until_first_value() {
        let state = DeviceState::new(TagMap::default());
        assert_eq!(state.init_execute_state(), None);
        assert!(state.set("InitExecuteState", 0));
        assert_eq!(state.init_execute_state(), Some(ExecuteState::NotExecute));
        assert!(!state.set("InitExecuteState", 0));
    }

    #[test]
    fn untracked_fields_are_ignored() {
        let state = DeviceState::new(TagMap::default());
        assert!(!state.set("NotAField", 1));
        assert_eq!(state.get("NotAField"), None);
    }

    #[test]
    fn ready_and_work_transitions_are_timestamped() {
        let state = DeviceState::new(TagMap::default());
        assert!(state.ready_in_at().is_none());

        state.apply("ReceiveToolingReadyState", ReadyState::NotReady.code());
        assert!(state.ready_in_at().is_none());
        state.apply("ReceiveToolingReadyState", ReadyState::HasReady.code());
        assert!(state.ready_in_at().is_some());
        assert!(state.ready_out_at().is_none());

        state.apply("WorkAreaWorkState", WorkAreaState::Working.code());
        assert!(state.work_started_at().is_some());
    }

    #[test]
    fn readers_on_other_threads_see_latest_write() {
        let state = Arc::new(DeviceState::new(TagMap::default()));
        state.set_connection(ConnectionState::Connected);
        let reader = state.clone();
        let seen = thread::spawn(move || reader.connection()).join().unwrap();
        assert_eq!(seen, ConnectionState::Connected);
    }

    #[test]
    fn snapshot_serializes_every_field() {
        let state = DeviceState::new(TagMap::default());
        state.set("DeviceState", 3);
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["fields"]["DeviceState"], 3);
        assert!(json["fields"]["InitExecuteState"].is_null());
        assert_eq!(json["connection"], "Disconnected");
    }
}
