pub mod cli;
pub mod config;
pub mod error;
pub mod markup;
pub mod model;
pub mod persistence;
pub mod session;
pub mod storage;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use model::{Note, NoteId, NoteLimits, OwnerId};
pub use persistence::{MemoryNoteStore, NoteStore, SqliteNoteStore};
pub use session::{DraftView, EditingSession, SessionNotice};
