use std::collections::HashMap;
use std::mem;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::SessionEvent;
use crate::model::NoteId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTicket {
    pub note_id: NoteId,
    pub generation: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePhase {
    Idle,
    PendingTimer,
    Saving,
}

#[derive(Debug)]
enum SaveState {
    Idle,
    PendingTimer {
        note_id: NoteId,
        generation: u64,
        seq: u64,
        timer: JoinHandle<()>,
    },
    Saving {
        note_id: NoteId,
        generation: u64,
        /// in-flight save this cycle waits on
        seq: u64,
        /// delay of the follow-up cycle armed once the save settles
        resave: Option<Duration>,
    },
}

/// Trailing-edge debounce with a single timer, serializing saves per note.
#[derive(Debug)]
pub struct AutosaveScheduler {
    debounce: Duration,
    enabled: bool,
    state: SaveState,
    next_seq: u64,
    in_flight: HashMap<NoteId, u64>,
    events: UnboundedSender<SessionEvent>,
}

impl AutosaveScheduler {
    pub fn new(debounce: Duration, enabled: bool, events: UnboundedSender<SessionEvent>) -> Self {
        Self {
            debounce,
            enabled,
            state: SaveState::Idle,
            next_seq: 0,
            in_flight: HashMap::new(),
            events,
        }
    }

    pub fn phase(&self) -> SavePhase {
        match self.state {
            SaveState::Idle => SavePhase::Idle,
            SaveState::PendingTimer { .. } => SavePhase::PendingTimer,
            SaveState::Saving { .. } => SavePhase::Saving,
        }
    }

    pub fn is_saving(&self) -> bool {
        self.phase() == SavePhase::Saving
    }

    pub fn has_in_flight(&self, note_id: &NoteId) -> bool {
        self.in_flight.contains_key(note_id)
    }

    /// No-op when autosave is disabled.
    pub fn schedule_save(&mut self, note_id: &NoteId, generation: u64) {
        if !self.enabled {
            return;
        }
        self.schedule(note_id, generation, self.debounce);
    }

    /// Skips the quiet period, also when autosave is disabled.
    pub fn schedule_now(&mut self, note_id: &NoteId, generation: u64) {
        self.schedule(note_id, generation, Duration::ZERO);
    }

    /// In-flight saves keep running and stay tracked.
    pub fn reset(&mut self) {
        if let SaveState::PendingTimer { note_id, timer, .. } =
            mem::replace(&mut self.state, SaveState::Idle)
        {
            timer.abort();
            tracing::debug!(%note_id, "discarded pending autosave timer");
        }
    }

    /// `None` when the timer was superseded or a save of the same note is
    /// still in flight.
    pub fn on_timer_fire(&mut self, seq: u64) -> Option<SaveTicket> {
        let (note_id, generation) = match mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::PendingTimer {
                note_id,
                generation,
                seq: armed,
                ..
            } if armed == seq => (note_id, generation),
            other => {
                self.state = other;
                tracing::trace!(seq, "ignoring superseded autosave timer");
                return None;
            }
        };

        if let Some(&busy) = self.in_flight.get(&note_id) {
            tracing::debug!(%note_id, busy, "save already in flight, waiting for it");
            self.state = SaveState::Saving {
                note_id,
                generation,
                seq: busy,
                resave: Some(Duration::ZERO),
            };
            return None;
        }

        self.in_flight.insert(note_id.clone(), seq);
        self.state = SaveState::Saving {
            note_id: note_id.clone(),
            generation,
            seq,
            resave: None,
        };
        Some(SaveTicket {
            note_id,
            generation,
            seq,
        })
    }

    /// False for background saves left over from an earlier selection.
    pub fn on_save_settled(&mut self, ticket: &SaveTicket) -> bool {
        if self.in_flight.get(&ticket.note_id) == Some(&ticket.seq) {
            self.in_flight.remove(&ticket.note_id);
        }
        let (note_id, generation, resave) = match mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::Saving {
                note_id,
                generation,
                seq,
                resave,
            } if seq == ticket.seq && note_id == ticket.note_id => (note_id, generation, resave),
            other => {
                self.state = other;
                return false;
            }
        };
        if let Some(delay) = resave {
            self.arm(note_id, generation, delay);
        }
        true
    }

    fn schedule(&mut self, note_id: &NoteId, generation: u64, delay: Duration) {
        if !self.defer_while_saving(note_id, generation, delay) {
            self.arm(note_id.clone(), generation, delay);
        }
    }

    fn defer_while_saving(&mut self, note_id: &NoteId, generation: u64, delay: Duration) -> bool {
        match &mut self.state {
            SaveState::Saving {
                note_id: saving,
                generation: current,
                resave,
                ..
            } if saving == note_id && *current == generation => {
                *resave = Some(resave.map_or(delay, |pending| pending.min(delay)));
                true
            }
            _ => false,
        }
    }

    fn arm(&mut self, note_id: NoteId, generation: u64, delay: Duration) {
        if let SaveState::PendingTimer { timer, .. } = &self.state {
            timer.abort();
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::TimerFired { seq });
        });
        tracing::trace!(%note_id, seq, delay_ms = delay.as_millis() as u64, "armed autosave timer");
        self.state = SaveState::PendingTimer {
            note_id,
            generation,
            seq,
            timer,
        };
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        if let SaveState::PendingTimer { timer, .. } = &self.state {
            timer.abort();
        }
    }
}
