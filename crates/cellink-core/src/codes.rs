// ── Device field codes ──
//
// Numeric values the station exchanges through its u16 fields. Each
// code set is a `repr(u16)` enum so reads can be matched exhaustively
// and writes never carry a bare literal.

use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

use cellink_api::Variant;

macro_rules! field_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
        #[repr(u16)]
        #[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub const fn code(self) -> u16 {
                self as u16
            }

            /// Decode a raw field value.
            pub fn from_code(code: u16) -> Option<Self> {
                Self::from_repr(code)
            }

            /// Decode a tag value, `None` if it is not a known code.
            pub fn from_variant(value: &Variant) -> Option<Self> {
                value.as_u16().and_then(Self::from_repr)
            }
        }

        impl From<$name> for u16 {
            fn from(v: $name) -> u16 {
                v.code()
            }
        }

        impl From<$name> for Variant {
            fn from(v: $name) -> Variant {
                Variant::UInt16(v.code())
            }
        }
    };
}

field_codes! {
    /// Progress of a command the station has been asked to execute.
    ExecuteState {
        NotExecute = 0,
        Executing = 1,
        Finished = 2,
        ErrorExecuting = 3,
    }
}

field_codes! {
    /// Command word written to (or polled from) a command field.
    SendCommand {
        NotExecute = 0,
        NeedExecute = 1,
        Executing = 2,
    }
}

field_codes! {
    /// Arbiter answer to a plan request.
    PlanRespond {
        InitValue = 0,
        AllowedPlan = 1,
        NotAllowedPlan = 2,
    }
}

field_codes! {
    PlanState {
        NotBeInPlanning = 0,
        BeInPlanning = 1,
    }
}

field_codes! {
    /// Ready-to-receive / ready-to-send flag.
    ReadyState {
        NotReady = 0,
        HasReady = 1,
    }
}

field_codes! {
    /// Request flag raised by the device for the data-request and upload cycles.
    RequireState {
        NotRequire = 0,
        Require = 1,
    }
}

field_codes! {
    DataValid {
        NotValid = 0,
        IsValid = 1,
    }
}

field_codes! {
    /// Whether pushed tooling data applies to every position.
    DoAllFlag {
        NotDoAll = 0,
        DoAll = 1,
    }
}

field_codes! {
    LockState {
        Unlocked = 0,
        Locked = 1,
    }
}

field_codes! {
    WorkAreaState {
        NoneWork = 0,
        Working = 1,
    }
}

field_codes! {
    ToolingPresence {
        NoTooling = 0,
        HasTooling = 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_variant() {
        let v: Variant = ExecuteState::Finished.into();
        assert_eq!(v, Variant::UInt16(2));
        assert_eq!(ExecuteState::from_variant(&v), Some(ExecuteState::Finished));
        assert_eq!(PlanRespond::from_code(9), None);
    }

    #[test]
    fn display_uses_device_names() {
        assert_eq!(PlanRespond::NotAllowedPlan.to_string(), "NOT_ALLOWED_PLAN");
        assert_eq!(ReadyState::HasReady.to_string(), "HAS_READY");
    }
}
