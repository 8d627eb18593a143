pub mod actor;
pub mod messages;
pub mod registry;
pub mod room;
pub mod scoring;

pub use actor::{RoomCommand, RoomHandle, RoomSummary};
pub use registry::RoomRegistry;
