//! Asynchronous reply delivery.
//!
//! The automation webhook does not return the answer; the answer shows up later as
//! an assistant row in the message store. A [`WatchSession`] looks for that row over
//! a push subscription and, redundantly, by polling, and reports what it finds as
//! [`WatchEvent`]s. The [`Timeline`] applies those events to what the console shows.

mod session;
mod timeline;

pub use session::{PendingReply, WatchEvent, WatchSession, WatchSettings, WatchUpdate};
pub use timeline::{Entry, Outcome, PlaceholderId, Slot, Timeline};
