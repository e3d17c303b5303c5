//! Durable per-server mapping from section to the last published message id.
//!
//! The document is a flat TOML table keyed by section. Keys this process does
//! not know are kept as they are so that newer sections survive a round trip.

use log::{error, info, warn};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use toml::{Table, Value};

use crate::error::StoreError;
use crate::section::{MessageId, Section};

/// Store handle shared by the dispatch workers of one server.
pub type SharedStore = Arc<Mutex<MessageIdStore>>;

#[derive(Debug)]
pub struct MessageIdStore {
    server: Arc<str>,
    path: PathBuf,
    document: Table,
    last_flushed: Option<Table>,
    writes: u64,
}

impl MessageIdStore {
    /// Loads the document at `path`, substituting defaults for anything
    /// missing or malformed. Never fails.
    pub async fn load(server: impl Into<Arc<str>>, path: impl Into<PathBuf>) -> Self {
        let server = server.into();
        let path = path.into();

        info!("{server} loading message IDs from {}", path.display());
        let loaded = match fs::read_to_string(&path).await {
            Ok(contents) => match toml::from_str::<Table>(&contents) {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!("{server} malformed message ID file {}: {e}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{server} message ID file {} not found", path.display());
                None
            }
            Err(e) => {
                warn!("{server} could not read message ID file {}: {e}", path.display());
                None
            }
        };

        let clean = loaded.is_some();
        let mut document = loaded.unwrap_or_else(|| {
            warn!("{server} no message IDs loaded, creating a new document");
            Table::new()
        });
        let repaired = repair(&server, &mut document);

        MessageIdStore {
            last_flushed: (clean && !repaired).then(|| document.clone()),
            server,
            path,
            document,
            writes: 0,
        }
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, section: Section) -> MessageId {
        self.document
            .get(section.key())
            .and_then(Value::as_integer)
            .and_then(|id| u64::try_from(id).ok())
            .map_or(MessageId::NONE, MessageId)
    }

    /// Every known section with its current id.
    pub fn snapshot(&self) -> Vec<(Section, MessageId)> {
        Section::ALL.into_iter().map(|s| (s, self.get(s))).collect()
    }

    pub fn set(&mut self, section: Section, id: MessageId) -> Result<(), StoreError> {
        let value = i64::try_from(id.0).map_err(|_| StoreError::IdOutOfRange(id.0))?;
        self.document
            .insert(section.key().to_string(), Value::Integer(value));
        Ok(())
    }

    /// Whether the in-memory document differs from what was last written.
    pub fn is_dirty(&self) -> bool {
        self.last_flushed.as_ref() != Some(&self.document)
    }

    /// Number of writes performed so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Writes the document if it changed since the last write.
    ///
    /// Returns whether a write happened.
    pub async fn flush(&mut self) -> Result<bool, StoreError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.write().await?;
        Ok(true)
    }

    /// Writes the document regardless of the last flushed snapshot.
    ///
    /// Used on the crash and shutdown paths.
    pub async fn flush_unconditionally(&mut self) -> Result<(), StoreError> {
        self.write().await
    }

    async fn write(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let serialized = toml::to_string(&self.document)?;

        // Write next to the target and rename so a crash never leaves a torn file
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(serialized.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        info!("{} saved message IDs to {}", self.server, self.path.display());
        self.last_flushed = Some(self.document.clone());
        self.writes += 1;
        Ok(())
    }
}

/// Fills in missing or invalid section keys. Returns whether anything changed.
fn repair(server: &str, document: &mut Table) -> bool {
    let mut changed = false;

    for section in Section::ALL {
        let valid = document
            .get(section.key())
            .and_then(Value::as_integer)
            .is_some_and(|id| id >= 0);
        if !valid {
            if document.contains_key(section.key()) {
                error!("{server} invalid message ID for {section}, resetting it");
            } else {
                warn!("{server} creating missing {section} message ID");
            }
            document.insert(section.key().to_string(), Value::Integer(0));
            changed = true;
        }
    }

    for key in document.keys() {
        if Section::from_key(key).is_none() {
            warn!("{server} unknown field {key} in saved message IDs, keeping it");
        }
    }

    changed
}

/// Flushes unconditionally and logs instead of failing.
pub async fn flush_on_exit(store: &SharedStore) {
    let mut store = store.lock().await;
    if let Err(e) = store.flush_unconditionally().await {
        error!(
            "{} failed to save message IDs to {}: {e}",
            store.server(),
            store.path().display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_zero() -> Vec<(Section, MessageId)> {
        Section::ALL.into_iter().map(|s| (s, MessageId::NONE)).collect()
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageIdStore::load("alpha", dir.path().join("alpha.toml")).await;

        assert_eq!(store.snapshot(), all_zero());
        assert!(store.is_dirty(), "Synthesized defaults should be written once");
    }

    #[tokio::test]
    async fn test_first_dispatch_is_flushed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.toml");
        let mut store = MessageIdStore::load("alpha", &path).await;

        store.set(Section::Header, MessageId(12345)).unwrap();
        assert!(store.flush().await.unwrap());
        assert!(!store.flush().await.unwrap());
        assert_eq!(store.writes(), 1);

        let reloaded = MessageIdStore::load("alpha", &path).await;
        assert_eq!(reloaded.get(Section::Header), MessageId(12345));
        assert_eq!(reloaded.get(Section::PlayerStats), MessageId::NONE);
        assert!(!reloaded.is_dirty());
    }

    #[tokio::test]
    async fn test_round_trip_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bravo.toml");
        std::fs::write(&path, "header = 5\ngamestate = 6\n").unwrap();

        let mut store = MessageIdStore::load("bravo", &path).await;
        assert_eq!(store.get(Section::Header), MessageId(5));
        assert_eq!(store.get(Section::MapRotation), MessageId::NONE);
        assert!(store.flush().await.unwrap());

        let reloaded = MessageIdStore::load("bravo", &path).await;
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[tokio::test]
    async fn test_unknown_keys_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.toml");
        std::fs::write(&path, "scoreboard = 99\n").unwrap();

        let mut store = MessageIdStore::load("alpha", &path).await;
        store.flush().await.unwrap();

        let written: Table = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.get("scoreboard"), Some(&Value::Integer(99)));
        assert_eq!(written.get("header"), Some(&Value::Integer(0)));
    }

    #[tokio::test]
    async fn test_malformed_file_is_replaced_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.toml");
        std::fs::write(&path, "header = [not toml").unwrap();

        let store = MessageIdStore::load("alpha", &path).await;
        assert_eq!(store.snapshot(), all_zero());
    }

    #[tokio::test]
    async fn test_invalid_values_are_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.toml");
        std::fs::write(&path, "header = \"abc\"\ngamestate = -4\nmap_rotation = 8\n").unwrap();

        let store = MessageIdStore::load("alpha", &path).await;
        assert_eq!(store.get(Section::Header), MessageId::NONE);
        assert_eq!(store.get(Section::Gamestate), MessageId::NONE);
        assert_eq!(store.get(Section::MapRotation), MessageId(8));
    }

    #[tokio::test]
    async fn test_unconditional_flush_ignores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids").join("alpha.toml");
        let mut store = MessageIdStore::load("alpha", path).await;

        store.flush().await.unwrap();
        store.flush_unconditionally().await.unwrap();
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn test_ids_beyond_toml_range_are_rejected() {
        let mut store = MessageIdStore {
            server: "alpha".into(),
            path: PathBuf::from("alpha.toml"),
            document: Table::new(),
            last_flushed: None,
            writes: 0,
        };
        assert!(matches!(
            store.set(Section::Header, MessageId(u64::MAX)),
            Err(StoreError::IdOutOfRange(_))
        ));
    }
}
