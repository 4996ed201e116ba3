// ── Station tag map ──
//
// Symbolic names of every device field the station touches. Defaults
// match the station firmware; profiles may override any single name.

use serde::{Deserialize, Serialize};

use crate::model::Direction;

/// The five fields that drive one transfer direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTags {
    /// Ready flag (`ReadyState`).
    pub ready: String,
    /// Plan state written by the client (`PlanState`).
    pub plan_state: String,
    /// Plan answer from the arbiter (`PlanRespond`).
    pub plan_respond: String,
    /// Command word (`SendCommand`).
    pub command: String,
    /// Command progress (`ExecuteState`).
    pub execute_state: String,
}

impl TransferTags {
    fn prefixed(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}ReadyState"),
            plan_state: format!("Plan{prefix}State"),
            plan_respond: format!("Plan{prefix}Respond"),
            command: format!("{prefix}Command"),
            execute_state: format!("{prefix}ExecuteState"),
        }
    }
}

/// Fields of the device-initiated data-request cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireDataTags {
    /// Request flag raised by the device (`RequireState`).
    pub request: String,
    /// Cycle progress (`ExecuteState`).
    pub execute_state: String,
    pub identifier_type: String,
    pub identifier: String,
    pub tooling_index: String,
    pub tooling_content: String,
    pub do_all: String,
    pub data_valid: String,
    /// Command word written together with the payload.
    pub command: String,
}

/// Fields of the device-initiated upload cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTags {
    pub request: String,
    pub execute_state: String,
    pub data_valid: String,
    pub identifier_type: String,
    pub identifier: String,
    pub tooling_index: String,
    pub tooling_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagMap {
    pub device_type: String,
    pub device_state: String,
    pub work_area_state: String,
    pub work_area_tooling: String,
    pub show_main_ui: String,
    pub config_main_control: String,
    pub init_command: String,
    pub init_execute_state: String,
    pub lock: String,
    pub receive: TransferTags,
    pub send: TransferTags,
    pub require_data: RequireDataTags,
    pub upload: UploadTags,
}

impl Default for TagMap {
    fn default() -> Self {
        Self {
            device_type: "DeviceType".into(),
            device_state: "DeviceState".into(),
            work_area_state: "WorkAreaWorkState".into(),
            work_area_tooling: "WorkAreaToolingState".into(),
            show_main_ui: "ShowMainControlUi".into(),
            config_main_control: "ConfigMainControl".into(),
            init_command: "InitCommand".into(),
            init_execute_state: "InitExecuteState".into(),
            lock: "BeLocked".into(),
            receive: TransferTags::prefixed("ReceiveTooling"),
            send: TransferTags::prefixed("SendTooling"),
            require_data: RequireDataTags {
                request: "RequireDataCommand".into(),
                execute_state: "RequireDataExecuteState".into(),
                identifier_type: "RequireDataIdentifierType".into(),
                identifier: "RequireDataIdentifier".into(),
                tooling_index: "ToolingDataIndex".into(),
                tooling_content: "ToolingDataContent".into(),
                do_all: "ToolingDataDoAll".into(),
                data_valid: "ToolingDataIsValid".into(),
                command: "ToolingDataCommand".into(),
            },
            upload: UploadTags {
                request: "UploadDataCommand".into(),
                execute_state: "UploadDataExecuteState".into(),
                data_valid: "UploadDataIsValid".into(),
                identifier_type: "UploadIdentifierType".into(),
                identifier: "UploadIdentifier".into(),
                tooling_index: "UploadToolingIndex".into(),
                tooling_content: "UploadToolingContent".into(),
            },
        }
    }
}

impl TagMap {
    pub fn transfer(&self, direction: Direction) -> &TransferTags {
        match direction {
            Direction::PutIn => &self.receive,
            Direction::TakeOut => &self.send,
        }
    }

    /// Fields mirrored into the device-state snapshot through change notification.
    pub fn monitored(&self) -> Vec<&str> {
        vec![
            self.init_execute_state.as_str(),
            self.receive.plan_respond.as_str(),
            self.receive.execute_state.as_str(),
            self.receive.ready.as_str(),
            self.send.plan_respond.as_str(),
            self.send.execute_state.as_str(),
            self.send.ready.as_str(),
            self.device_state.as_str(),
            self.work_area_state.as_str(),
            self.work_area_tooling.as_str(),
            self.show_main_ui.as_str(),
            self.require_data.request.as_str(),
            self.upload.request.as_str(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_use_distinct_fields() {
        let tags = TagMap::default();
        assert_eq!(tags.transfer(Direction::PutIn).command, "ReceiveToolingCommand");
        assert_eq!(tags.transfer(Direction::TakeOut).plan_respond, "PlanSendToolingRespond");
    }

    #[test]
    fn monitored_fields_are_unique() {
        let tags = TagMap::default();
        let mut fields = tags.monitored();
        let len = fields.len();
        fields.sort_unstable();
        fields.dedup();
        assert_eq!(fields.len(), len);
    }
}
