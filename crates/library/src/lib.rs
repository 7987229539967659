//! Cache-first orchestration over a [`FileStore`](songbook_storage::FileStore).
//!
//! The boundary between file stores and whatever presents files to a user:
//! reads race the offline cache against the network ([`reconcile`]), stale
//! results are dropped ([`Generation`]), and failures become messages a user
//! can act on ([`failure_message`]).

pub mod error;
mod message;
mod reconcile;
mod recover;
mod session;

pub use crate::message::{Operation, describe, failure_message};
pub use crate::reconcile::{Reconcile, Reconciled, reconcile};
pub use crate::recover::load_or_create_text;
pub use crate::session::{Generation, Session, Ticket};
