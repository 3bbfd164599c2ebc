//! In-memory client state fed by sync payloads.
//!
//! [`GlobalStore`] owns one [`RoomStore`] per joined room and the sorted room
//! list. Lock order is always global before room.

/// Per-room memory trimming.
pub mod gc;
/// Client-wide room map, room list, and account data.
pub mod global;
/// Member and bot-command lists derived from room state.
pub mod members;
/// Timeline, indices, and state of a single room.
pub mod room;
/// Room list entries and their ordering.
pub mod room_list;

pub use gc::{GcPolicy, GcStats};
pub use global::{GlobalStore, SpaceTree};
pub use members::{BotCommand, Member};
pub use room::{MarkReadParams, RoomStore, Timeline, TypingUsers};
pub use room_list::{RoomList, RoomListEntry};
