//! samstudio-session: per-image annotation sessions
//!
//! A [`Session`] binds one open image to its embedding lease, its undoable
//! annotation history and its issue threads. The [`SessionManager`] owns the
//! set of open sessions.

pub mod history;
pub mod issues;
pub mod manager;
pub mod session;

pub use history::{AnnotationHistory, EditKind, EntryKind, HistoryEntry, HistoryOutcome, Operation};
pub use issues::{Comment, IssueStore, IssueThread, ThreadStatus};
pub use manager::SessionManager;
pub use session::{Session, SessionStatus};
