// Session metadata and persistence

pub mod index;
pub mod metadata;
pub mod storage;

pub use index::SessionIndex;
pub use metadata::{SessionReport, SessionSummary};
pub use storage::SessionStore;
