//! The conversation store: one JSON file per conversation.
//!
//! Files live flat in a single directory, named
//! `<sanitized_title>_<conversation_id>.json`.  Saves go through a sibling
//! temp file, `fsync`, and an atomic rename, so `list()` never observes a
//! torn write.  Writes are serialized per conversation id; reads run
//! concurrently.  All blocking file I/O is pushed onto the runtime's
//! blocking pool.
//!
//! Readers accept both the current layout and the legacy flat-history layout
//! (`{"conversation_id", "history": […]}`); legacy files are converted in
//! memory on load and only rewritten in the new layout by the next save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;
use uuid::Uuid;

use crate::loomllm::conversation::Conversation;
use crate::loomllm::error::Error;

/// One row of a store listing.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: Option<String>,
    pub title: String,
    pub filename: String,
    pub path: PathBuf,
    pub created_at: Option<String>,
    pub model: Option<String>,
    pub message_count: usize,
}

/// Filesystem-backed conversation store.
pub struct ConversationStore {
    dir: PathBuf,
    write_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    last_listing: std::sync::Mutex<Vec<ConversationSummary>>,
}

/// Sanitize a title for use in a filename: whitespace to `_`, everything
/// outside `[A-Za-z0-9_-]` stripped, lowercased, capped at 40 characters.
pub fn sanitize_title(title: &str) -> String {
    let mut sanitized = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_whitespace() {
            sanitized.push('_');
        } else if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            sanitized.push(c.to_ascii_lowercase());
        }
    }
    sanitized.chars().take(40).collect()
}

/// Canonical filename for a conversation.
pub fn format_filename(title: &str, conversation_id: &str) -> String {
    format!("{}_{}.json", sanitize_title(title), conversation_id)
}

fn summarize_file(path: &Path, value: &Value) -> ConversationSummary {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // New layout keeps metadata at the top level; the legacy layout buries
    // it in a history item.
    let mut metadata = value.get("metadata").cloned();
    if metadata.is_none() {
        if let Some(history) = value.get("history").and_then(Value::as_array) {
            metadata = history
                .iter()
                .find(|item| item.get("type").and_then(Value::as_str) == Some("metadata"))
                .and_then(|item| item.get("content"))
                .cloned();
        }
    }
    let metadata = metadata.unwrap_or(Value::Null);

    let mut message_count = value
        .get("messages")
        .and_then(Value::as_object)
        .map(|m| m.len())
        .unwrap_or(0);
    if message_count == 0 {
        if let Some(history) = value.get("history").and_then(Value::as_array) {
            message_count = history
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
                .count();
        }
    }

    ConversationSummary {
        id: value
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        title: metadata
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Untitled")
            .to_string(),
        filename,
        path: path.to_path_buf(),
        created_at: metadata
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string),
        model: metadata
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        message_count,
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4().simple()));
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(&tmp);
            Err(err)
        }
    }
}

impl ConversationStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::ConfigInvalid(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(ConversationStore {
            dir,
            write_locks: AsyncMutex::new(HashMap::new()),
            last_listing: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_lock(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// List every parseable conversation file.
    ///
    /// Unparsable files are skipped with a warning; the listing never fails
    /// because of one bad file.  The result is cached for numeric-index
    /// resolution in [`load`](ConversationStore::load).
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, Error> {
        let dir = self.dir.clone();
        let summaries = task::spawn_blocking(move || -> Result<Vec<ConversationSummary>, Error> {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| Error::ConfigInvalid(format!("cannot read {}: {}", dir.display(), e)))?;
            let mut summaries = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let contents = match std::fs::read_to_string(&path) {
                    Ok(contents) => contents,
                    Err(err) => {
                        log::warn!("skipping unreadable {}: {}", path.display(), err);
                        continue;
                    }
                };
                match serde_json::from_str::<Value>(&contents) {
                    Ok(value) => summaries.push(summarize_file(&path, &value)),
                    Err(err) => {
                        log::warn!("skipping unparsable {}: {}", path.display(), err);
                    }
                }
            }
            summaries.sort_by(|a, b| a.filename.cmp(&b.filename));
            Ok(summaries)
        })
        .await
        .map_err(|e| Error::InvariantViolation(format!("listing task failed: {}", e)))??;

        if let Ok(mut cached) = self.last_listing.lock() {
            *cached = summaries.clone();
        }
        Ok(summaries)
    }

    /// Resolve an identifier against the directory.
    ///
    /// Tried in order: exact conversation id, exact filename, filename with
    /// `.json` appended, case-insensitive title, 1-based numeric index into
    /// the most recent listing.
    async fn resolve(&self, identifier: &str) -> Result<ConversationSummary, Error> {
        let listing = self.list().await?;
        if let Some(hit) = listing
            .iter()
            .find(|s| s.id.as_deref() == Some(identifier))
        {
            return Ok(hit.clone());
        }
        if let Some(hit) = listing.iter().find(|s| s.filename == identifier) {
            return Ok(hit.clone());
        }
        let with_ext = format!("{}.json", identifier);
        if let Some(hit) = listing.iter().find(|s| s.filename == with_ext) {
            return Ok(hit.clone());
        }
        let lowered = identifier.to_lowercase();
        if let Some(hit) = listing.iter().find(|s| s.title.to_lowercase() == lowered) {
            return Ok(hit.clone());
        }
        if let Ok(index) = identifier.parse::<usize>() {
            if index >= 1 && index <= listing.len() {
                return Ok(listing[index - 1].clone());
            }
        }
        Err(Error::NotFound(format!("conversation '{}'", identifier)))
    }

    /// Load a conversation by identifier (see [`resolve`](Self::resolve) for
    /// the resolution order).
    pub async fn load(&self, identifier: &str) -> Result<Conversation, Error> {
        let summary = self.resolve(identifier).await?;
        let path = summary.path.clone();
        let conversation = task::spawn_blocking(move || -> Result<Conversation, Error> {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                Error::ConversationCorrupt(format!("{}: {}", path.display(), e))
            })?;
            let value: Value = serde_json::from_str(&contents).map_err(|e| {
                Error::ConversationCorrupt(format!("{}: {}", path.display(), e))
            })?;
            Conversation::from_value(value)
        })
        .await
        .map_err(|e| Error::InvariantViolation(format!("load task failed: {}", e)))??;

        conversation
            .check_invariants()
            .map_err(|e| Error::ConversationCorrupt(e.to_string()))?;
        Ok(conversation)
    }

    async fn write_to(&self, conversation: &Conversation, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(conversation)
            .map_err(|e| Error::InvariantViolation(format!("serialize: {}", e)))?;
        let lock = self.write_lock(&conversation.id).await;
        let _guard = lock.lock().await;
        let path = path.to_path_buf();
        task::spawn_blocking(move || {
            write_atomic(&path, &json)
                .map_err(|e| Error::ConfigInvalid(format!("cannot write {}: {}", path.display(), e)))
        })
        .await
        .map_err(|e| Error::InvariantViolation(format!("save task failed: {}", e)))?
    }

    /// Persist a conversation under its canonical filename, stamping
    /// `updated_at`.  Returns the file path.
    pub async fn save(&self, conversation: &mut Conversation) -> Result<PathBuf, Error> {
        conversation.metadata.updated_at = chrono::Utc::now();
        let filename = format_filename(&conversation.metadata.title, &conversation.id);
        let path = self.dir.join(filename);
        self.write_to(conversation, &path).await?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "saved conversation {} ({} messages) to {}",
                conversation.id,
                conversation.messages.len(),
                path.display()
            );
        }
        Ok(path)
    }

    /// Retitle a conversation: update metadata, save in place, then rename
    /// the file if the derived filename changed.
    pub async fn rename(&self, identifier: &str, new_title: &str) -> Result<Conversation, Error> {
        let summary = self.resolve(identifier).await?;
        let mut conversation = self.load(identifier).await?;
        conversation.metadata.title = new_title.to_string();
        conversation.metadata.updated_at = chrono::Utc::now();

        let old_path = summary.path.clone();
        self.write_to(&conversation, &old_path).await?;

        let new_filename = format_filename(new_title, &conversation.id);
        if summary.filename != new_filename {
            let new_path = self.dir.join(&new_filename);
            task::spawn_blocking(move || {
                std::fs::rename(&old_path, &new_path).map_err(|e| {
                    Error::ConfigInvalid(format!("cannot rename to {}: {}", new_path.display(), e))
                })
            })
            .await
            .map_err(|e| Error::InvariantViolation(format!("rename task failed: {}", e)))??;
        }
        Ok(conversation)
    }

    /// Deep-copy a conversation under fresh ids.
    ///
    /// Structure is preserved via an old-id → new-id mapping rewritten into
    /// `parent_id`, `children`, branch tips and the active leaf; the copy
    /// gets a new conversation id, fresh `created_at`/`updated_at`, and the
    /// title `new_title` (default: `"<source> (Copy)"`).
    pub async fn duplicate(
        &self,
        source_identifier: &str,
        new_title: Option<&str>,
    ) -> Result<Conversation, Error> {
        let source = self.load(source_identifier).await?;

        let id_map: HashMap<String, String> = source
            .messages
            .keys()
            .map(|old| (old.clone(), Uuid::new_v4().to_string()))
            .collect();

        let mut copy = source.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.metadata.title = new_title
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} (Copy)", source.metadata.title));
        let stamp = chrono::Utc::now();
        copy.metadata.created_at = stamp;
        copy.metadata.updated_at = stamp;

        let mut messages = HashMap::with_capacity(source.messages.len());
        for (old_id, message) in &source.messages {
            let mut cloned = message.clone();
            cloned.id = id_map[old_id].clone();
            cloned.parent_id = message
                .parent_id
                .as_ref()
                .and_then(|p| id_map.get(p).cloned());
            cloned.children = message
                .children
                .iter()
                .filter_map(|c| id_map.get(c).cloned())
                .collect();
            messages.insert(cloned.id.clone(), cloned);
        }
        copy.messages = messages;

        for info in copy.branches.values_mut() {
            info.last_message = info
                .last_message
                .as_ref()
                .and_then(|m| id_map.get(m).cloned());
        }

        copy.metadata.active_leaf = source
            .metadata
            .active_leaf
            .as_ref()
            .and_then(|leaf| id_map.get(leaf).cloned())
            .or_else(|| {
                copy.messages
                    .values()
                    .max_by_key(|m| m.timestamp)
                    .map(|m| m.id.clone())
            });

        self.save(&mut copy).await?;
        Ok(copy)
    }

    /// Remove a conversation file if it exists.
    pub async fn delete(&self, identifier: &str) -> Result<(), Error> {
        let summary = self.resolve(identifier).await?;
        let path = summary.path;
        task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::ConfigInvalid(format!(
                "cannot delete {}: {}",
                path.display(),
                err
            ))),
        })
        .await
        .map_err(|e| Error::InvariantViolation(format!("delete task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_sanitize_to_filesystem_safe_stems() {
        assert_eq!(sanitize_title("My Chat: Draft #2"), "my_chat_draft_2");
        assert_eq!(sanitize_title("  spaced  out  "), "__spaced__out__");
        let long = "A".repeat(80);
        assert_eq!(sanitize_title(&long).len(), 40);
    }

    #[test]
    fn filenames_carry_title_and_id() {
        let name = format_filename("Trip Notes", "abc-123");
        assert_eq!(name, "trip_notes_abc-123.json");
    }
}
