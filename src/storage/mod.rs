use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};
use crate::error::{StoreError, StoreResult};
use crate::model::{Note, NoteId, NoteLimits, OwnerId};

mod schema;

const NOTE_COLUMNS: &str = "id, owner, title, content, created_at, updated_at";
const DEFAULT_IMAGE_NAME: &str = "image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub note_id: NoteId,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
    limits: NoteLimits,
}

impl StorageHandle {
    pub fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&*self.db_path).map_err(|err| {
            StoreError::network(format!(
                "opening database {}: {err}",
                self.db_path.display()
            ))
        })?;
        prepare_connection(&conn, &self.options)
            .map_err(|err| StoreError::network(format!("{err:#}")))?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn create_note(&self, owner: &OwnerId, title: &str, content: &str) -> StoreResult<Note> {
        self.limits.check_title(title)?;
        let id = NoteId::generate();
        let now = now_millis();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO notes (id, owner, title, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id.as_str(), owner.as_str(), title, content, now],
            )?;
            fetch_note(conn, &id)?.ok_or_else(|| StoreError::NotFound(id.clone()))
        })
    }

    pub fn update_note(
        &self,
        owner: &OwnerId,
        id: &NoteId,
        title: &str,
        content: &str,
    ) -> StoreResult<Note> {
        self.limits.check_title(title)?;
        self.with_connection(|conn| {
            ensure_owned(conn, owner, id)?;
            conn.execute(
                "UPDATE notes SET title = ?1, content = ?2, updated_at = ?3 WHERE id = ?4",
                params![title, content, now_millis(), id.as_str()],
            )?;
            fetch_note(conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone()))
        })
    }

    pub fn delete_note(&self, owner: &OwnerId, id: &NoteId) -> StoreResult<()> {
        self.with_connection(|conn| {
            ensure_owned(conn, owner, id)?;
            conn.execute("DELETE FROM notes WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        })
    }

    pub fn fetch_note(&self, owner: &OwnerId, id: &NoteId) -> StoreResult<Note> {
        self.with_connection(|conn| {
            ensure_owned(conn, owner, id)?;
            fetch_note(conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone()))
        })
    }

    pub fn list_notes(&self, owner: &OwnerId) -> StoreResult<Vec<Note>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {NOTE_COLUMNS}
                 FROM notes
                 WHERE owner = ?1
                 ORDER BY created_at DESC, rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let notes = stmt
                .query_map(params![owner.as_str()], note_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(notes)
        })
    }

    pub fn insert_image(
        &self,
        owner: &OwnerId,
        note_id: &NoteId,
        file_name: &str,
        bytes: &[u8],
    ) -> StoreResult<String> {
        if bytes.is_empty() {
            return Err(StoreError::validation("image file is empty"));
        }
        let file_name = sanitize_file_name(file_name);
        let image_id = uuid::Uuid::new_v4().simple().to_string();
        self.with_connection(|conn| {
            ensure_owned(conn, owner, note_id)?;
            conn.execute(
                "INSERT INTO images (id, note_id, file_name, bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![image_id, note_id.as_str(), file_name, bytes, now_millis()],
            )?;
            Ok(())
        })?;
        Ok(format!(
            "{}/{}/{}/{}",
            self.options.asset_base_url, note_id, image_id, file_name
        ))
    }

    pub fn delete_images_for_note(&self, owner: &OwnerId, note_id: &NoteId) -> StoreResult<usize> {
        self.with_connection(|conn| {
            ensure_owned(conn, owner, note_id)?;
            let removed = conn.execute(
                "DELETE FROM images WHERE note_id = ?1",
                params![note_id.as_str()],
            )?;
            Ok(removed)
        })
    }

    /// Resolves a url produced by [`insert_image`](Self::insert_image).
    pub fn fetch_image(&self, url: &str) -> StoreResult<Option<StoredImage>> {
        let Some(rest) = url
            .strip_prefix(self.options.asset_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Ok(None);
        };
        let mut parts = rest.splitn(3, '/');
        let (Some(note_id), Some(image_id)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };
        self.with_connection(|conn| {
            let image = conn
                .query_row(
                    "SELECT note_id, file_name, bytes FROM images WHERE id = ?1 AND note_id = ?2",
                    params![image_id, note_id],
                    |row| {
                        Ok(StoredImage {
                            note_id: NoteId::from(row.get::<_, String>(0)?),
                            file_name: row.get(1)?,
                            bytes: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(image)
        })
    }
}

fn ensure_owned(conn: &Connection, owner: &OwnerId, id: &NoteId) -> StoreResult<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT owner FROM notes WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => Err(StoreError::NotFound(id.clone())),
        Some(stored) if stored != owner.as_str() => Err(StoreError::Unauthorized(format!(
            "note {id} belongs to another user"
        ))),
        Some(_) => Ok(()),
    }
}

fn fetch_note(conn: &Connection, id: &NoteId) -> StoreResult<Option<Note>> {
    let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1");
    let note = conn
        .query_row(&sql, params![id.as_str()], note_from_row)
        .optional()?;
    Ok(note)
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: NoteId::from(row.get::<_, String>(0)?),
        owner: OwnerId::from(row.get::<_, String>(1)?),
        title: row.get(2)?,
        content: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        updated_at: from_millis(row.get(5)?),
    })
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn sanitize_file_name(raw: &str) -> String {
    let base = Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(|ch| ch == '.' || ch == '_').is_empty() {
        DEFAULT_IMAGE_NAME.to_string()
    } else {
        cleaned
    }
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions, limits: NoteLimits) -> Result<StorageHandle> {
    let db_path = &paths.database_path;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "note database ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
        limits,
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    pub(crate) fn init_storage() -> anyhow::Result<(TempDir, StorageHandle)> {
        let temp = TempDir::new()?;
        let config_dir = temp.path().join("config");
        let paths = ConfigPaths::rooted(
            config_dir.clone(),
            config_dir.join("config.toml"),
            temp.path().join("data"),
        );
        paths.ensure_directories()?;
        let mut options = StorageOptions::default();
        options.database_path = paths.database_path.clone();
        let storage = init(&paths, &options, NoteLimits::default())?;
        Ok((temp, storage))
    }

    fn alice() -> OwnerId {
        OwnerId::from("alice")
    }

    #[test]
    fn created_note_is_listed_for_owner() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let note = storage.create_note(&alice(), "A", "B")?;

        let listed = storage.list_notes(&alice())?;
        assert!(listed
            .iter()
            .any(|n| n.id == note.id && n.title == "A" && n.content == "B"));
        assert!(storage.list_notes(&OwnerId::from("bob"))?.is_empty());
        Ok(())
    }

    #[test]
    fn list_is_newest_first() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let first = storage.create_note(&alice(), "first", "")?;
        let second = storage.create_note(&alice(), "second", "")?;
        let third = storage.create_note(&alice(), "third", "")?;

        let ids: Vec<_> = storage
            .list_notes(&alice())?
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
        Ok(())
    }

    #[test]
    fn repeated_update_is_idempotent_on_fields() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let note = storage.create_note(&alice(), "", "")?;

        let once = storage.update_note(&alice(), &note.id, "T", "<p>c</p>")?;
        let twice = storage.update_note(&alice(), &note.id, "T", "<p>c</p>")?;
        assert_eq!((once.title.as_str(), once.content.as_str()), ("T", "<p>c</p>"));
        assert_eq!((twice.title, twice.content), (once.title, once.content));
        assert!(twice.updated_at >= once.updated_at);
        assert_eq!(twice.created_at, note.created_at);
        Ok(())
    }

    #[test]
    fn update_reports_missing_and_foreign_notes() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let note = storage.create_note(&alice(), "mine", "")?;

        assert_matches!(
            storage.update_note(&alice(), &NoteId::from("nope"), "x", ""),
            Err(StoreError::NotFound(_))
        );
        assert_matches!(
            storage.update_note(&OwnerId::from("mallory"), &note.id, "x", ""),
            Err(StoreError::Unauthorized(_))
        );
        assert_matches!(
            storage.delete_note(&alice(), &NoteId::from("nope")),
            Err(StoreError::NotFound(_))
        );
        Ok(())
    }

    #[test]
    fn overlong_title_is_rejected() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let title = "x".repeat(121);
        assert_matches!(
            storage.create_note(&alice(), &title, ""),
            Err(StoreError::Validation(_))
        );
        Ok(())
    }

    #[test]
    fn images_round_trip_through_urls_and_cleanup() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let note = storage.create_note(&alice(), "pics", "")?;

        let url = storage.insert_image(&alice(), &note.id, "../holiday photo.png", b"png")?;
        assert!(url.starts_with(&format!("notedraft://assets/{}/", note.id)));
        assert!(url.ends_with("/holiday_photo.png"));

        let image = storage.fetch_image(&url)?.expect("image stored");
        assert_eq!(image.bytes, b"png");
        assert_eq!(image.note_id, note.id);

        assert_eq!(storage.delete_images_for_note(&alice(), &note.id)?, 1);
        assert!(storage.fetch_image(&url)?.is_none());
        assert_eq!(storage.fetch_image("https://elsewhere/x")?, None);
        Ok(())
    }

    #[test]
    fn deleting_note_drops_its_images() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let note = storage.create_note(&alice(), "pics", "")?;
        let url = storage.insert_image(&alice(), &note.id, "a.png", b"1")?;

        storage.delete_note(&alice(), &note.id)?;
        assert!(storage.fetch_image(&url)?.is_none());
        assert_matches!(
            storage.fetch_note(&alice(), &note.id),
            Err(StoreError::NotFound(_))
        );
        Ok(())
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("/tmp/a b.jpg"), "a_b.jpg");
        assert_eq!(sanitize_file_name(""), "image");
        assert_eq!(sanitize_file_name("..."), "image");
    }
}
