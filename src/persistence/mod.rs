use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{Note, NoteId, OwnerId};

mod memory;
mod sqlite;

pub use memory::{MemoryNoteStore, StoreCall};
pub use sqlite::SqliteNoteStore;

#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn create_note(&self, title: &str, content: &str) -> StoreResult<Note>;

    async fn update_note(&self, id: &NoteId, title: &str, content: &str) -> StoreResult<Note>;

    async fn delete_note(&self, id: &NoteId) -> StoreResult<()>;

    /// Notes of `owner`, newest first by creation time.
    async fn list_notes(&self, owner: &OwnerId) -> StoreResult<Vec<Note>>;

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        note_id: &NoteId,
    ) -> StoreResult<String>;

    /// Best effort; failures are only logged.
    async fn delete_images_for_note(&self, note_id: &NoteId);
}
