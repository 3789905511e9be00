use serde::{Deserialize, Serialize};

use crate::failure::Failure;
use crate::payload::Payload;

/// Marker names are part of the persisted wire format. Changing one breaks
/// replay of every open workflow recorded with the old name.
pub const SIDE_EFFECT_MARKER_NAME: &str = "windlass_side_effect";
pub const MUTABLE_SIDE_EFFECT_MARKER_NAME: &str = "windlass_mutable_side_effect";
pub const VERSION_MARKER_NAME: &str = "windlass_version";
pub const LOCAL_ACTIVITY_MARKER_NAME: &str = "windlass_local_activity";

/// Details of a `windlass_side_effect` marker. `id` is the per-run
/// invocation counter; replay matches calls to markers by it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SideEffectMarker {
    pub id: u64,
    pub result: Payload,
}

/// Details of a `windlass_mutable_side_effect` marker.
///
/// `skip_count` is the number of invocations for this `id` since the last
/// recorded marker; it disambiguates which call site a sparsely recorded
/// marker belongs to during replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableSideEffectMarker {
    pub id: String,
    pub skip_count: u32,
    pub value: Payload,
}

/// Details of a `windlass_version` marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub change_id: String,
    pub version: i32,
}

/// Details of a `windlass_local_activity` marker, recorded on completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalActivityMarker {
    pub activity_id: String,
    pub activity_type: String,
    pub result: Option<Payload>,
    pub failure: Option<Failure>,
    /// Workflow time at completion, replayed as-is.
    pub replay_time_millis: i64,
    pub attempt: u32,
    pub backoff_millis: Option<u64>,
}

/// A recognized marker, decoded from a `MarkerRecorded` event.
#[derive(Clone, Debug, PartialEq)]
pub enum KnownMarker {
    SideEffect(SideEffectMarker),
    MutableSideEffect(MutableSideEffectMarker),
    Version(VersionMarker),
    LocalActivity(LocalActivityMarker),
}

impl KnownMarker {
    /// Decode marker details by name. Returns `None` for foreign markers
    /// (other SDKs may record their own) or undecodable payloads.
    pub fn parse(marker_name: &str, details: Option<&Payload>) -> Option<Self> {
        let details = details?;
        match marker_name {
            SIDE_EFFECT_MARKER_NAME => details.decode_json().ok().map(Self::SideEffect),
            MUTABLE_SIDE_EFFECT_MARKER_NAME => {
                details.decode_json().ok().map(Self::MutableSideEffect)
            }
            VERSION_MARKER_NAME => details.decode_json().ok().map(Self::Version),
            LOCAL_ACTIVITY_MARKER_NAME => details.decode_json().ok().map(Self::LocalActivity),
            _ => None,
        }
    }

    pub fn marker_name(&self) -> &'static str {
        match self {
            Self::SideEffect(_) => SIDE_EFFECT_MARKER_NAME,
            Self::MutableSideEffect(_) => MUTABLE_SIDE_EFFECT_MARKER_NAME,
            Self::Version(_) => VERSION_MARKER_NAME,
            Self::LocalActivity(_) => LOCAL_ACTIVITY_MARKER_NAME,
        }
    }

    /// Encode the details for a `RecordMarker` command.
    ///
    /// Serialization of these plain structs cannot fail.
    pub fn encode(&self) -> Payload {
        let bytes = match self {
            Self::SideEffect(m) => serde_json::to_vec(m),
            Self::MutableSideEffect(m) => serde_json::to_vec(m),
            Self::Version(m) => serde_json::to_vec(m),
            Self::LocalActivity(m) => serde_json::to_vec(m),
        }
        .expect("marker details serialize");
        Payload::new(bytes)
    }
}
