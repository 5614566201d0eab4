//! # alumnet-proto
//!
//! Wire vocabulary for the alumnet realtime change-notification channel:
//! subscription filters, change records, and the JSON channel frames
//! exchanged with the backend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod change;
pub mod error;
pub mod filter;
pub mod messages;

pub use change::{ChangeKind, ChangeRecord};
pub use error::ProtoError;
pub use filter::{EventFilter, FilterOp, FilterSpec, RowFilter};
pub use messages::{ChannelMessage, ServerEvent};
