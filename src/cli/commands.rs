use std::fmt::Write as _;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::AppConfig;
use crate::markup;
use crate::model::{Note, NoteId};
use crate::persistence::{NoteStore, SqliteNoteStore};
use crate::session::{EditingSession, SessionNotice};

const PREVIEW_GRAPHEMES: usize = 72;
const DEFAULT_IMAGE_NAME: &str = "image";

#[derive(Args, Debug, Clone)]
pub struct NewArgs {
    /// Title for the note (prompted if omitted)
    #[arg()]
    pub title: Option<String>,
    /// Provide the note body inline, one paragraph per line. If omitted,
    /// reads from stdin.
    #[arg(long)]
    pub content: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Limit the number of notes printed
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Print the notes as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NoteArgs {
    /// Note identifier
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Note identifier
    pub id: String,
    /// Delete without asking for confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AttachArgs {
    /// Note identifier
    pub id: String,
    /// Image file to upload
    pub file: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Note identifier
    pub id: String,
    /// Override auto_save.debounce_ms for this session
    #[arg(long)]
    pub debounce_ms: Option<u64>,
}

pub async fn new_note(store: &SqliteNoteStore, args: NewArgs) -> Result<()> {
    let title = match args.title {
        Some(t) => t,
        None if atty::is(atty::Stream::Stdin) => prompt("Title")?,
        None => String::new(),
    };
    let body = match args.content {
        Some(body) => body,
        None => read_stdin()?.unwrap_or_default(),
    };

    let note = store
        .create_note(title.trim(), &paragraphs(&body))
        .await
        .context("creating note")?;
    println!("Created note {}", note.id);
    Ok(())
}

pub async fn list_notes(store: &SqliteNoteStore, args: ListArgs) -> Result<()> {
    let mut notes = store
        .list_notes(store.owner())
        .await
        .context("listing notes")?;
    notes.truncate(args.limit);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&notes)?);
    } else {
        print!("{}", format_note_list(&notes));
    }
    Ok(())
}

pub async fn show_note(store: &SqliteNoteStore, args: NoteArgs) -> Result<()> {
    let id = NoteId::from(args.id.as_str());
    let note = store
        .fetch_note(&id)
        .await
        .with_context(|| format!("loading note {id}"))?;
    print!("{}", format_note_detail(&note));
    Ok(())
}

pub async fn delete_note(store: &SqliteNoteStore, config: &AppConfig, args: DeleteArgs) -> Result<()> {
    let id = NoteId::from(args.id.as_str());
    if !args.yes {
        if !atty::is(atty::Stream::Stdin) {
            bail!("refusing to delete note {id} without --yes when stdin is not a terminal");
        }
        let note = store
            .fetch_note(&id)
            .await
            .with_context(|| format!("loading note {id}"))?;
        let answer = prompt(&format!(
            "Delete \"{}\" and its images? [y/N]",
            display_title(&note.title)
        ))?;
        if !is_affirmative(&answer) {
            println!("Kept note {id}");
            return Ok(());
        }
    }
    let mut session = open_session(store, config);
    session
        .delete_note(&id)
        .await
        .with_context(|| format!("deleting note {id}"))?;
    println!("Deleted note {id}");
    Ok(())
}

pub async fn attach_image(store: &SqliteNoteStore, config: &AppConfig, args: AttachArgs) -> Result<()> {
    let id = NoteId::from(args.id.as_str());
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let note = store
        .fetch_note(&id)
        .await
        .with_context(|| format!("loading note {id}"))?;

    let mut session = open_session(store, config);
    session.select_note(Some(note));
    session.attach_image(bytes, &file_name_of(&args.file))?;
    flush(&mut session, 1).await?;
    Ok(())
}

pub async fn edit_note(store: &SqliteNoteStore, config: &AppConfig, args: EditArgs) -> Result<()> {
    let id = NoteId::from(args.id.as_str());
    let note = store
        .fetch_note(&id)
        .await
        .with_context(|| format!("loading note {id}"))?;

    let mut auto_save = config.auto_save.clone();
    if let Some(ms) = args.debounce_ms {
        auto_save.debounce_ms = ms;
    }
    let mut session = EditingSession::new(Arc::new(store.clone()), &auto_save, config.limits);
    if atty::is(atty::Stream::Stdin) {
        println!(
            "Editing {}. Lines are appended; :title TEXT, :image PATH, :save, :quit.",
            display_title(&note.title)
        );
    }
    session.select_note(Some(note));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut uploads = 0usize;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                let command = EditCommand::parse(&line);
                if command == EditCommand::Quit {
                    break;
                }
                if let Err(err) = apply(&mut session, command, &mut uploads).await {
                    eprintln!("error: {err:#}");
                }
            }
            Some(event) = session.next_event() => {
                if let Some(notice) = session.handle_event(event)? {
                    uploads -= settled_uploads(&notice).min(uploads);
                    report(&notice);
                }
            }
        }
    }
    flush(&mut session, uploads).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EditCommand {
    Append(String),
    Title(String),
    Image(PathBuf),
    Save,
    Quit,
    Unknown(String),
}

impl EditCommand {
    fn parse(line: &str) -> Self {
        if let Some(literal) = line.strip_prefix("::") {
            return Self::Append(format!(":{literal}"));
        }
        let Some(rest) = line.strip_prefix(':') else {
            return Self::Append(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest.trim(), ""),
        };
        match name {
            "title" | "t" => Self::Title(arg.to_string()),
            "image" | "i" if !arg.is_empty() => Self::Image(PathBuf::from(arg)),
            "save" | "w" => Self::Save,
            "quit" | "q" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

async fn apply(session: &mut EditingSession, command: EditCommand, uploads: &mut usize) -> Result<()> {
    match command {
        EditCommand::Append(text) => {
            let mut content = session.current_draft().content;
            content.push_str(&markup::paragraph(&text));
            let end = content.len();
            session.edit_content(&content)?;
            session.set_cursor(end);
        }
        EditCommand::Title(text) => session.edit_title(&text)?,
        EditCommand::Image(path) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            session.attach_image(bytes, &file_name_of(&path))?;
            *uploads += 1;
        }
        EditCommand::Save => session.save_now()?,
        EditCommand::Quit => {}
        EditCommand::Unknown(name) => bail!("unknown command :{name}"),
    }
    Ok(())
}

/// Drives the session until outstanding uploads have landed and the draft
/// matches the persisted note.
async fn flush(session: &mut EditingSession, mut uploads: usize) -> Result<()> {
    loop {
        if uploads == 0 && !session.is_saving() {
            if !session.has_unsaved_changes() {
                return Ok(());
            }
            session.save_now()?;
        }
        let Some(notice) = session.process_next().await? else {
            continue;
        };
        uploads -= settled_uploads(&notice).min(uploads);
        report(&notice);
        match notice {
            SessionNotice::SaveFailed { error, .. } => {
                return Err(error).context("saving draft");
            }
            SessionNotice::ImageFailed { error, .. } => {
                return Err(error).context("uploading image");
            }
            _ => {}
        }
    }
}

fn settled_uploads(notice: &SessionNotice) -> usize {
    match notice {
        SessionNotice::ImageInserted { .. }
        | SessionNotice::ImageFailed { .. }
        | SessionNotice::StaleImageDiscarded { .. } => 1,
        _ => 0,
    }
}

fn report(notice: &SessionNotice) {
    if let Some(line) = describe_notice(notice) {
        println!("{line}");
    }
}

fn describe_notice(notice: &SessionNotice) -> Option<String> {
    match notice {
        SessionNotice::Saved { note } => Some(format!(
            "saved {} at {}",
            note.id,
            format_timestamp(note.updated_at)
        )),
        SessionNotice::SaveFailed { error, .. } => Some(format!(
            "save failed ({}): {error}; draft kept, :save to retry",
            error.kind()
        )),
        SessionNotice::ImageInserted { url, .. } => Some(format!("image inserted: {url}")),
        SessionNotice::ImageFailed { error, .. } => {
            Some(format!("image upload failed ({}): {error}", error.kind()))
        }
        SessionNotice::StaleSaveDiscarded { .. } | SessionNotice::StaleImageDiscarded { .. } => {
            None
        }
    }
}

fn open_session(store: &SqliteNoteStore, config: &AppConfig) -> EditingSession {
    EditingSession::new(Arc::new(store.clone()), &config.auto_save, config.limits)
}

fn format_note_list(notes: &[Note]) -> String {
    if notes.is_empty() {
        return "No notes yet.\n".to_string();
    }
    let mut out = String::new();
    for (idx, note) in notes.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let _ = writeln!(&mut out, "{}  {}", note.id, display_title(&note.title));
        let _ = writeln!(&mut out, "    updated {}", format_timestamp(note.updated_at));
        let preview = preview(&note.content);
        if !preview.is_empty() {
            let _ = writeln!(&mut out, "    {preview}");
        }
    }
    out
}

fn format_note_detail(note: &Note) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "{}", display_title(&note.title));
    let _ = writeln!(&mut out, "id       {}", note.id);
    let _ = writeln!(&mut out, "created  {}", format_timestamp(note.created_at));
    let _ = writeln!(&mut out, "updated  {}", format_timestamp(note.updated_at));
    let images = markup::image_sources(&note.content);
    if !images.is_empty() {
        let _ = writeln!(&mut out, "images   {}", images.join(" "));
    }
    let text = markup::plain_text(&note.content);
    if !text.is_empty() {
        let _ = writeln!(&mut out, "\n{text}");
    }
    out
}

fn preview(content: &str) -> String {
    let text = markup::plain_text(content);
    let mut graphemes = text.graphemes(true);
    let head: String = graphemes.by_ref().take(PREVIEW_GRAPHEMES).collect();
    if graphemes.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

fn display_title(title: &str) -> &str {
    if title.trim().is_empty() {
        "(untitled)"
    } else {
        title
    }
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn paragraphs(body: &str) -> String {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(markup::paragraph)
        .collect()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_IMAGE_NAME)
        .to_string()
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end().to_owned())
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoSaveConfig;
    use crate::error::StoreError;
    use crate::model::{NoteLimits, OwnerId};
    use crate::persistence::MemoryNoteStore;
    use time::macros::datetime;

    fn note(id: &str, title: &str, content: &str, updated_at: OffsetDateTime) -> Note {
        Note {
            id: NoteId::from(id),
            owner: OwnerId::from("me"),
            title: title.to_string(),
            content: content.to_string(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn parses_edit_commands() {
        assert_eq!(EditCommand::parse("hello"), EditCommand::Append("hello".into()));
        assert_eq!(EditCommand::parse("::) smile"), EditCommand::Append(":) smile".into()));
        assert_eq!(
            EditCommand::parse(":title  Weekly plan "),
            EditCommand::Title("Weekly plan".into())
        );
        assert_eq!(EditCommand::parse(":title"), EditCommand::Title(String::new()));
        assert_eq!(
            EditCommand::parse(":image ./cat.png"),
            EditCommand::Image(PathBuf::from("./cat.png"))
        );
        assert_eq!(EditCommand::parse(":image"), EditCommand::Unknown("image".into()));
        assert_eq!(EditCommand::parse(":w"), EditCommand::Save);
        assert_eq!(EditCommand::parse(":q"), EditCommand::Quit);
        assert_eq!(EditCommand::parse(":nope"), EditCommand::Unknown("nope".into()));
    }

    #[test]
    fn note_list_format() {
        let notes = vec![
            note(
                "n1",
                "Groceries",
                "<p>milk &amp; eggs</p>",
                datetime!(2024-05-01 10:00 UTC),
            ),
            note("n2", "", "", datetime!(2024-05-02 09:30 UTC)),
        ];
        insta::assert_snapshot!(format_note_list(&notes), @r###"
        n1  Groceries
            updated 2024-05-01 10:00
            milk & eggs

        n2  (untitled)
            updated 2024-05-02 09:30
        "###);
        assert_eq!(format_note_list(&[]), "No notes yet.\n");
    }

    #[test]
    fn long_previews_are_truncated() {
        let content = markup::paragraph(&"é".repeat(200));
        let text = preview(&content);
        assert!(text.ends_with('…'));
        assert_eq!(text.graphemes(true).count(), PREVIEW_GRAPHEMES + 1);
    }

    #[test]
    fn notices_read_as_status_lines() {
        let saved = SessionNotice::Saved {
            note: note("n1", "t", "", datetime!(2024-05-01 10:00 UTC)),
        };
        assert_eq!(
            describe_notice(&saved).as_deref(),
            Some("saved n1 at 2024-05-01 10:00")
        );
        let failed = SessionNotice::SaveFailed {
            note_id: NoteId::from("n1"),
            error: StoreError::network("timeout"),
        };
        assert_eq!(
            describe_notice(&failed).as_deref(),
            Some("save failed (network-failure): store unavailable: timeout; draft kept, :save to retry")
        );
        let stale = SessionNotice::StaleSaveDiscarded {
            note_id: NoteId::from("n1"),
        };
        assert_eq!(describe_notice(&stale), None);
    }

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(is_affirmative("y"));
        assert!(is_affirmative(" YES "));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("no"));
    }

    #[test]
    fn body_lines_become_paragraphs() {
        assert_eq!(paragraphs("one\n\n two \n"), "<p>one</p><p> two </p>");
        assert_eq!(paragraphs(""), "");
    }

    #[tokio::test(start_paused = true)]
    async fn appended_lines_are_flushed_on_quit() -> Result<()> {
        let store = Arc::new(MemoryNoteStore::new(OwnerId::from("me")));
        let seeded = store.seed("log", "");
        let mut session = EditingSession::new(
            store.clone(),
            &AutoSaveConfig::default(),
            NoteLimits::default(),
        );
        session.select_note(Some(seeded.clone()));

        let mut uploads = 0;
        apply(&mut session, EditCommand::parse("first"), &mut uploads).await?;
        apply(&mut session, EditCommand::parse("second"), &mut uploads).await?;
        apply(&mut session, EditCommand::parse(":title Log"), &mut uploads).await?;
        assert!(apply(&mut session, EditCommand::parse(":bogus"), &mut uploads)
            .await
            .is_err());
        flush(&mut session, uploads).await?;

        let saved = store.note(&seeded.id).expect("note kept");
        assert_eq!(saved.title, "Log");
        assert_eq!(saved.content, "<p>first</p><p>second</p>");
        assert_eq!(store.updates().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attach_is_an_error() {
        let store = Arc::new(MemoryNoteStore::new(OwnerId::from("me")));
        let seeded = store.seed("pics", "<p>body</p>");
        let mut session = EditingSession::new(
            store.clone(),
            &AutoSaveConfig::default(),
            NoteLimits::default(),
        );
        session.select_note(Some(seeded.clone()));
        session
            .attach_image(Vec::new(), "empty.png")
            .expect("upload started");

        let err = flush(&mut session, 1).await.expect_err("upload rejected");
        assert!(format!("{err:#}").contains("image file is empty"));
        assert_eq!(session.current_draft().content, "<p>body</p>");
        assert!(store.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_surfaces_save_failures() {
        let store = Arc::new(MemoryNoteStore::new(OwnerId::from("me")));
        let seeded = store.seed("", "");
        let mut session = EditingSession::new(
            store.clone(),
            &AutoSaveConfig::default(),
            NoteLimits::default(),
        );
        session.select_note(Some(seeded));
        session.edit_title("unsaved").expect("edit accepted");
        store.fail_next_update(StoreError::network("offline"));

        let err = flush(&mut session, 0).await.expect_err("save failed");
        assert!(format!("{err:#}").contains("store unavailable: offline"));
        assert_eq!(session.current_draft().title, "unsaved");
    }
}
