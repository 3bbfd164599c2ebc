mod event;
mod room;
mod sync;

pub use event::{
    Event, EventRowId, NOT_SENT_ERROR, PENDING_TIMELINE_OFFSET, RelationType,
    SYNTHETIC_EVENT_PREFIX, TimelineRowId, VisibilityPrefs, event_type,
};
pub use room::{
    AccountData, CreationContent, InvitedRoom, LazyLoadSummary, NameQuality, Predecessor, Room,
    SpaceEdge, StrippedStateEvent, Tombstone,
};
pub use sync::{
    EventsDecrypted, EventsFetched, PaginationResult, RoomStateKind, RoomStateResult,
    SendComplete, SyncComplete, SyncRoom, TimelineRowTuple, Typing,
};
