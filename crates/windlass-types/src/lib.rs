pub mod command;
pub mod event;
pub mod failure;
pub mod marker;
pub mod payload;
pub mod retry;

pub use command::{Command, CommandType};
pub use event::{EventAttributes, EventType, HistoryEvent};
pub use failure::{
    ActivityFailure, ApplicationFailure, CanceledFailure, ChildWorkflowFailure, Failure,
    TimeoutFailure, TimeoutKind,
};
pub use marker::{
    KnownMarker, LocalActivityMarker, MutableSideEffectMarker, SideEffectMarker, VersionMarker,
    LOCAL_ACTIVITY_MARKER_NAME, MUTABLE_SIDE_EFFECT_MARKER_NAME, SIDE_EFFECT_MARKER_NAME,
    VERSION_MARKER_NAME,
};
pub use payload::Payload;
pub use retry::RetryPolicy;
