use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::NoteStore;
use crate::error::{StoreError, StoreResult};
use crate::model::{Note, NoteId, NoteLimits, OwnerId};

const ASSET_PREFIX: &str = "memory://images";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create { title: String, content: String },
    Update { id: NoteId, title: String, content: String },
    Delete { id: NoteId },
    List { owner: OwnerId },
    UploadImage { note_id: NoteId, file_name: String },
    DeleteImages { note_id: NoteId },
}

/// Latency applies to `update_note` and `upload_image` only.
pub struct MemoryNoteStore {
    owner: OwnerId,
    limits: NoteLimits,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    notes: Vec<(u64, Note)>,
    images: HashMap<String, NoteId>,
    calls: Vec<StoreCall>,
    latency: Duration,
    update_failures: VecDeque<StoreError>,
}

impl MemoryNoteStore {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            limits: NoteLimits::default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Makes the next `update_note` call fail with `err`.
    pub fn fail_next_update(&self, err: StoreError) {
        self.inner.lock().update_failures.push_back(err);
    }

    /// Not recorded as a call.
    pub fn seed(&self, title: &str, content: &str) -> Note {
        let mut inner = self.inner.lock();
        inner.insert(self.owner.clone(), title, content)
    }

    pub fn remove_remotely(&self, id: &NoteId) {
        self.inner.lock().notes.retain(|(_, note)| &note.id != id);
    }

    pub fn note(&self, id: &NoteId) -> Option<Note> {
        self.inner.lock().find(id).cloned()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().calls.clone()
    }

    pub fn updates(&self) -> Vec<(NoteId, String, String)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::Update { id, title, content } => {
                    Some((id.clone(), title.clone(), content.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn image_count(&self, note_id: &NoteId) -> usize {
        self.inner
            .lock()
            .images
            .values()
            .filter(|owner| *owner == note_id)
            .count()
    }

    fn record(&self, call: StoreCall) -> Duration {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        inner.latency
    }

    fn check_owned(&self, inner: &Inner, id: &NoteId) -> StoreResult<()> {
        match inner.find(id) {
            None => Err(StoreError::NotFound(id.clone())),
            Some(note) if note.owner != self.owner => Err(StoreError::Unauthorized(format!(
                "note {id} belongs to another user"
            ))),
            Some(_) => Ok(()),
        }
    }
}

impl Inner {
    fn find(&self, id: &NoteId) -> Option<&Note> {
        self.notes.iter().map(|(_, note)| note).find(|note| &note.id == id)
    }

    fn insert(&mut self, owner: OwnerId, title: &str, content: &str) -> Note {
        let now = OffsetDateTime::now_utc();
        let note = Note {
            id: NoteId::generate(),
            owner,
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.next_seq += 1;
        self.notes.push((self.next_seq, note.clone()));
        note
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn create_note(&self, title: &str, content: &str) -> StoreResult<Note> {
        self.record(StoreCall::Create {
            title: title.to_string(),
            content: content.to_string(),
        });
        self.limits.check_title(title)?;
        let mut inner = self.inner.lock();
        Ok(inner.insert(self.owner.clone(), title, content))
    }

    async fn update_note(&self, id: &NoteId, title: &str, content: &str) -> StoreResult<Note> {
        let latency = self.record(StoreCall::Update {
            id: id.clone(),
            title: title.to_string(),
            content: content.to_string(),
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.limits.check_title(title)?;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.update_failures.pop_front() {
            return Err(err);
        }
        self.check_owned(&inner, id)?;
        let note = inner
            .notes
            .iter_mut()
            .map(|(_, note)| note)
            .find(|note| &note.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        note.title = title.to_string();
        note.content = content.to_string();
        note.updated_at = OffsetDateTime::now_utc();
        Ok(note.clone())
    }

    async fn delete_note(&self, id: &NoteId) -> StoreResult<()> {
        self.record(StoreCall::Delete { id: id.clone() });
        let mut inner = self.inner.lock();
        self.check_owned(&inner, id)?;
        inner.notes.retain(|(_, note)| &note.id != id);
        inner.images.retain(|_, owner| owner != id);
        Ok(())
    }

    async fn list_notes(&self, owner: &OwnerId) -> StoreResult<Vec<Note>> {
        self.record(StoreCall::List {
            owner: owner.clone(),
        });
        let inner = self.inner.lock();
        let mut notes: Vec<_> = inner
            .notes
            .iter()
            .filter(|(_, note)| &note.owner == owner)
            .collect();
        notes.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });
        Ok(notes.into_iter().map(|(_, note)| note.clone()).collect())
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        note_id: &NoteId,
    ) -> StoreResult<String> {
        let latency = self.record(StoreCall::UploadImage {
            note_id: note_id.clone(),
            file_name: file_name.to_string(),
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if bytes.is_empty() {
            return Err(StoreError::validation("image file is empty"));
        }
        let mut inner = self.inner.lock();
        self.check_owned(&inner, note_id)?;
        let url = format!(
            "{ASSET_PREFIX}/{note_id}/{}/{file_name}",
            uuid::Uuid::new_v4().simple()
        );
        inner.images.insert(url.clone(), note_id.clone());
        Ok(url)
    }

    async fn delete_images_for_note(&self, note_id: &NoteId) {
        self.record(StoreCall::DeleteImages {
            note_id: note_id.clone(),
        });
        self.inner.lock().images.retain(|_, owner| owner != note_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn records_calls_and_lists_newest_first() -> anyhow::Result<()> {
        let store = MemoryNoteStore::new(OwnerId::from("me"));
        let first = store.create_note("one", "").await?;
        let second = store.create_note("two", "").await?;

        let listed = store.list_notes(&OwnerId::from("me")).await?;
        assert_eq!(
            listed.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
        assert_eq!(store.calls().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn injected_failure_applies_once() -> anyhow::Result<()> {
        let store = MemoryNoteStore::new(OwnerId::from("me"));
        let note = store.seed("t", "c");
        store.fail_next_update(StoreError::network("offline"));

        assert_matches!(
            store.update_note(&note.id, "t2", "c").await,
            Err(StoreError::Network(_))
        );
        let updated = store.update_note(&note.id, "t2", "c").await?;
        assert_eq!(updated.title, "t2");
        Ok(())
    }

    #[tokio::test]
    async fn remote_removal_surfaces_not_found() {
        let store = MemoryNoteStore::new(OwnerId::from("me"));
        let note = store.seed("t", "c");
        store.remove_remotely(&note.id);
        assert_matches!(
            store.update_note(&note.id, "t", "c").await,
            Err(StoreError::NotFound(_))
        );
    }
}
