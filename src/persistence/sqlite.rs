use async_trait::async_trait;

use super::NoteStore;
use crate::error::{StoreError, StoreResult};
use crate::model::{Note, NoteId, OwnerId};
use crate::storage::StorageHandle;

#[derive(Clone)]
pub struct SqliteNoteStore {
    storage: StorageHandle,
    owner: OwnerId,
}

impl SqliteNoteStore {
    pub fn new(storage: StorageHandle, owner: OwnerId) -> Self {
        Self { storage, owner }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub async fn fetch_note(&self, id: &NoteId) -> StoreResult<Note> {
        let id = id.clone();
        self.blocking(move |storage, owner| storage.fetch_note(owner, &id))
            .await
    }

    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&StorageHandle, &OwnerId) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        let owner = self.owner.clone();
        tokio::task::spawn_blocking(move || op(&storage, &owner)).await?
    }
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn create_note(&self, title: &str, content: &str) -> StoreResult<Note> {
        let (title, content) = (title.to_string(), content.to_string());
        self.blocking(move |storage, owner| storage.create_note(owner, &title, &content))
            .await
    }

    async fn update_note(&self, id: &NoteId, title: &str, content: &str) -> StoreResult<Note> {
        let (id, title, content) = (id.clone(), title.to_string(), content.to_string());
        self.blocking(move |storage, owner| storage.update_note(owner, &id, &title, &content))
            .await
    }

    async fn delete_note(&self, id: &NoteId) -> StoreResult<()> {
        let id = id.clone();
        self.blocking(move |storage, owner| storage.delete_note(owner, &id))
            .await
    }

    async fn list_notes(&self, owner: &OwnerId) -> StoreResult<Vec<Note>> {
        if owner != &self.owner {
            return Err(StoreError::Unauthorized(format!(
                "cannot list notes of {owner}"
            )));
        }
        self.blocking(|storage, owner| storage.list_notes(owner))
            .await
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        note_id: &NoteId,
    ) -> StoreResult<String> {
        let (file_name, note_id) = (file_name.to_string(), note_id.clone());
        self.blocking(move |storage, owner| {
            storage.insert_image(owner, &note_id, &file_name, &bytes)
        })
        .await
    }

    async fn delete_images_for_note(&self, note_id: &NoteId) {
        let target = note_id.clone();
        let result = self
            .blocking(move |storage, owner| storage.delete_images_for_note(owner, &target))
            .await;
        match result {
            Ok(removed) => tracing::debug!(%note_id, removed, "removed note images"),
            Err(err) => {
                tracing::debug!(%note_id, kind = %err.kind(), ?err, "image cleanup skipped")
            }
        }
    }
}
