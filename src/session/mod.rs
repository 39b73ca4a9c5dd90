use crate::error::StoreResult;
use crate::model::{Note, NoteId};

mod controller;
mod scheduler;

pub use controller::{DraftView, EditingSession, SessionNotice};
pub use scheduler::{AutosaveScheduler, SavePhase, SaveTicket};

/// Reports from spawned timer, save and upload tasks.
#[derive(Debug)]
pub enum SessionEvent {
    TimerFired {
        seq: u64,
    },
    SaveSettled {
        ticket: SaveTicket,
        result: StoreResult<Note>,
    },
    ImageUploaded {
        note_id: NoteId,
        generation: u64,
        result: StoreResult<String>,
    },
}
