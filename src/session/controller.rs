use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::scheduler::{AutosaveScheduler, SaveTicket};
use super::SessionEvent;
use crate::config::AutoSaveConfig;
use crate::error::{StoreError, StoreResult};
use crate::markup;
use crate::model::{Note, NoteId, NoteLimits};
use crate::persistence::NoteStore;

#[derive(Debug, Clone)]
struct Draft {
    title: String,
    content: String,
    /// byte offset into `content`
    cursor: usize,
}

impl Draft {
    fn seeded_from(note: &Note) -> Self {
        Self {
            title: note.title.clone(),
            content: note.content.clone(),
            cursor: note.content.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftView {
    pub note_id: Option<NoteId>,
    pub title: String,
    pub content: String,
    pub is_saving: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Saved { note: Note },
    SaveFailed { note_id: NoteId, error: StoreError },
    StaleSaveDiscarded { note_id: NoteId },
    ImageInserted { note_id: NoteId, url: String },
    ImageFailed { note_id: NoteId, error: StoreError },
    StaleImageDiscarded { note_id: NoteId },
}

#[derive(Debug)]
struct ActiveNote {
    persisted: Note,
    draft: Draft,
    orphaned: Option<StoreError>,
}

pub struct EditingSession {
    store: Arc<dyn NoteStore>,
    scheduler: AutosaveScheduler,
    limits: NoteLimits,
    generation: u64,
    active: Option<ActiveNote>,
    is_saving: bool,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
}

impl EditingSession {
    pub fn new(store: Arc<dyn NoteStore>, auto_save: &AutoSaveConfig, limits: NoteLimits) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let scheduler = AutosaveScheduler::new(
            auto_save.debounce_duration(),
            auto_save.enabled,
            events_tx.clone(),
        );
        Self {
            store,
            scheduler,
            limits,
            generation: 0,
            active: None,
            is_saving: false,
            events_tx,
            events_rx,
        }
    }

    pub fn selected_note_id(&self) -> Option<&NoteId> {
        self.active.as_ref().map(|active| &active.persisted.id)
    }

    pub fn persisted_note(&self) -> Option<&Note> {
        self.active.as_ref().map(|active| &active.persisted)
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active.draft.title != active.persisted.title
                || active.draft.content != active.persisted.content
        })
    }

    pub fn current_draft(&self) -> DraftView {
        match &self.active {
            Some(active) => DraftView {
                note_id: Some(active.persisted.id.clone()),
                title: active.draft.title.clone(),
                content: active.draft.content.clone(),
                is_saving: self.is_saving,
            },
            None => DraftView {
                note_id: None,
                title: String::new(),
                content: String::new(),
                is_saving: self.is_saving,
            },
        }
    }

    /// Selecting the note that is already open only refreshes the persisted
    /// baseline. Any other selection starts a new generation; saves still in
    /// flight finish in the background and their results are discarded.
    pub fn select_note(&mut self, note: Option<Note>) {
        if let (Some(active), Some(next)) = (self.active.as_mut(), note.as_ref()) {
            if active.persisted.id == next.id {
                active.persisted = next.clone();
                return;
            }
        }

        self.scheduler.reset();
        self.generation += 1;
        self.is_saving = false;
        self.active = note.map(|note| ActiveNote {
            draft: Draft::seeded_from(&note),
            persisted: note,
            orphaned: None,
        });
        tracing::debug!(
            note_id = ?self.selected_note_id().map(NoteId::as_str),
            generation = self.generation,
            "selection changed"
        );
    }

    pub fn edit_title(&mut self, text: &str) -> StoreResult<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        self.limits.check_title(text)?;
        if active.draft.title == text {
            return Ok(());
        }
        active.draft.title.clear();
        active.draft.title.push_str(text);
        self.request_save()
    }

    pub fn edit_content(&mut self, markup: &str) -> StoreResult<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.draft.content == markup {
            return Ok(());
        }
        active.draft.content.clear();
        active.draft.content.push_str(markup);
        active.draft.cursor = clamp_cursor(&active.draft.content, active.draft.cursor);
        self.request_save()
    }

    pub fn set_cursor(&mut self, offset: usize) {
        if let Some(active) = self.active.as_mut() {
            active.draft.cursor = clamp_cursor(&active.draft.content, offset);
        }
    }

    /// Saves without waiting for the quiet period, also after a failure.
    pub fn save_now(&mut self) -> StoreResult<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        if let Some(err) = &active.orphaned {
            return Err(err.clone());
        }
        let note_id = active.persisted.id.clone();
        self.scheduler.schedule_now(&note_id, self.generation);
        Ok(())
    }

    pub fn attach_image(&mut self, bytes: Vec<u8>, file_name: &str) -> StoreResult<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        if let Some(err) = &active.orphaned {
            return Err(err.clone());
        }
        let note_id = active.persisted.id.clone();
        let generation = self.generation;
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let file_name = file_name.to_string();
        tracing::debug!(%note_id, %file_name, size = bytes.len(), "uploading image");
        tokio::spawn(async move {
            let result = store.upload_image(bytes, &file_name, &note_id).await;
            let _ = events.send(SessionEvent::ImageUploaded {
                note_id,
                generation,
                result,
            });
        });
        Ok(())
    }

    pub async fn create_note(&mut self) -> StoreResult<Note> {
        let note = self.store.create_note("", "").await?;
        tracing::info!(note_id = %note.id, "created note");
        self.select_note(Some(note.clone()));
        Ok(note)
    }

    pub async fn delete_note(&mut self, id: &NoteId) -> StoreResult<()> {
        self.store.delete_images_for_note(id).await;
        self.store.delete_note(id).await?;
        tracing::info!(note_id = %id, "deleted note");
        if self.selected_note_id() == Some(id) {
            self.select_note(None);
        }
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub async fn process_next(&mut self) -> StoreResult<Option<SessionNotice>> {
        match self.next_event().await {
            Some(event) => self.handle_event(event),
            None => Ok(None),
        }
    }

    /// Applies a background event. `Unauthorized` failures are returned as
    /// errors for the auth layer; every other outcome is a notice.
    pub fn handle_event(&mut self, event: SessionEvent) -> StoreResult<Option<SessionNotice>> {
        let notice = match event {
            SessionEvent::TimerFired { seq } => {
                self.on_timer_fired(seq);
                Ok(None)
            }
            SessionEvent::SaveSettled { ticket, result } => self.on_save_settled(ticket, result),
            SessionEvent::ImageUploaded {
                note_id,
                generation,
                result,
            } => self.on_image_uploaded(note_id, generation, result),
        };
        self.is_saving = self.scheduler.is_saving();
        notice
    }

    fn request_save(&mut self) -> StoreResult<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        if let Some(err) = &active.orphaned {
            return Err(err.clone());
        }
        let note_id = active.persisted.id.clone();
        self.scheduler.schedule_save(&note_id, self.generation);
        Ok(())
    }

    fn is_current(&self, note_id: &NoteId, generation: u64) -> bool {
        generation == self.generation && self.selected_note_id() == Some(note_id)
    }

    fn on_timer_fired(&mut self, seq: u64) {
        let Some(ticket) = self.scheduler.on_timer_fire(seq) else {
            return;
        };
        let snapshot = self
            .active
            .as_ref()
            .filter(|_| self.is_current(&ticket.note_id, ticket.generation))
            .map(|active| (active.draft.title.clone(), active.draft.content.clone()));
        let Some((title, content)) = snapshot else {
            // selection moved on between arming and firing
            self.scheduler.on_save_settled(&ticket);
            return;
        };

        tracing::debug!(note_id = %ticket.note_id, seq = ticket.seq, "issuing autosave");
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = store.update_note(&ticket.note_id, &title, &content).await;
            let _ = events.send(SessionEvent::SaveSettled { ticket, result });
        });
    }

    fn on_save_settled(
        &mut self,
        ticket: SaveTicket,
        result: StoreResult<Note>,
    ) -> StoreResult<Option<SessionNotice>> {
        self.scheduler.on_save_settled(&ticket);

        if !self.is_current(&ticket.note_id, ticket.generation) {
            if let Err(err @ StoreError::Unauthorized(_)) = result {
                return Err(err);
            }
            tracing::debug!(note_id = %ticket.note_id, "discarding result of superseded save");
            return Ok(Some(SessionNotice::StaleSaveDiscarded {
                note_id: ticket.note_id,
            }));
        }

        match result {
            Ok(note) => {
                tracing::info!(note_id = %note.id, "note saved");
                if let Some(active) = self.active.as_mut() {
                    active.persisted = note.clone();
                }
                Ok(Some(SessionNotice::Saved { note }))
            }
            Err(err @ StoreError::Unauthorized(_)) => {
                tracing::warn!(note_id = %ticket.note_id, %err, "save rejected, session no longer authorized");
                Err(err)
            }
            Err(err) => Ok(Some(self.save_failed(ticket.note_id, err))),
        }
    }

    fn save_failed(&mut self, note_id: NoteId, err: StoreError) -> SessionNotice {
        tracing::warn!(
            %note_id,
            kind = %err.kind(),
            transient = err.is_transient(),
            %err,
            "autosave failed, draft kept"
        );
        if let StoreError::NotFound(_) = err {
            self.orphan(err.clone());
        }
        SessionNotice::SaveFailed {
            note_id,
            error: err,
        }
    }

    fn orphan(&mut self, err: StoreError) {
        self.scheduler.reset();
        if let Some(active) = self.active.as_mut() {
            active.orphaned = Some(err);
        }
    }

    fn on_image_uploaded(
        &mut self,
        note_id: NoteId,
        generation: u64,
        result: StoreResult<String>,
    ) -> StoreResult<Option<SessionNotice>> {
        if !self.is_current(&note_id, generation) {
            if let Err(err @ StoreError::Unauthorized(_)) = result {
                return Err(err);
            }
            tracing::debug!(%note_id, "discarding image upload for a deselected note");
            return Ok(Some(SessionNotice::StaleImageDiscarded { note_id }));
        }

        let orphaned = self.active.as_ref().and_then(|active| active.orphaned.clone());
        let url = match (result, orphaned) {
            (Err(err @ StoreError::Unauthorized(_)), _) => return Err(err),
            (Ok(_), Some(err)) => {
                tracing::debug!(%note_id, "note gone while uploading, image not inserted");
                return Ok(Some(SessionNotice::ImageFailed {
                    note_id,
                    error: err,
                }));
            }
            (Ok(url), None) => url,
            (Err(err), _) => {
                tracing::warn!(%note_id, kind = %err.kind(), %err, "image upload failed");
                if let StoreError::NotFound(_) = err {
                    self.orphan(err.clone());
                }
                return Ok(Some(SessionNotice::ImageFailed {
                    note_id,
                    error: err,
                }));
            }
        };

        if let Some(active) = self.active.as_mut() {
            let (content, cursor) = markup::insert_fragment(
                &active.draft.content,
                active.draft.cursor,
                &markup::image_tag(&url),
            );
            active.draft.content = content;
            active.draft.cursor = cursor;
        }
        tracing::debug!(%note_id, %url, "image inserted into draft");
        self.request_save()?;
        Ok(Some(SessionNotice::ImageInserted { note_id, url }))
    }
}

fn clamp_cursor(content: &str, offset: usize) -> usize {
    let mut at = offset.min(content.len());
    while !content.is_char_boundary(at) {
        at -= 1;
    }
    at
}
