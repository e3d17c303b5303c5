use std::{fmt, sync::Arc, time::Duration};

use crate::config::Config;
use crate::content::{BuilderRegistry, ContentBuilder};
use crate::error::Error;

/// The independently published content categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    Header,
    Gamestate,
    MapRotation,
    PlayerStats,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Header,
        Section::Gamestate,
        Section::MapRotation,
        Section::PlayerStats,
    ];

    /// Key used in config tables and in the persisted message-id document.
    pub fn key(self) -> &'static str {
        match self {
            Section::Header => "header",
            Section::Gamestate => "gamestate",
            Section::MapRotation => "map_rotation",
            Section::PlayerStats => "player_stats",
        }
    }

    pub fn from_key(key: &str) -> Option<Section> {
        Section::ALL.into_iter().find(|s| s.key() == key)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One (server, section) scheduling unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job {
    pub server: Arc<str>,
    pub section: Section,
}

impl Job {
    pub fn new(server: impl Into<Arc<str>>, section: Section) -> Self {
        Job {
            server: server.into(),
            section,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server, self.section)
    }
}

/// Identifier of a published webhook message. Zero means none was ever created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const NONE: MessageId = MessageId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `None` for the "no message" sentinel.
    pub fn existing(self) -> Option<MessageId> {
        (!self.is_none()).then_some(self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling view of a section, re-derived from every config reload.
#[derive(Clone)]
pub struct SectionConfig {
    pub enabled: bool,
    pub refresh_interval: Duration,
    pub builder: Arc<dyn ContentBuilder>,
}

impl SectionConfig {
    pub fn derive(
        config: &Config,
        section: Section,
        registry: &BuilderRegistry,
    ) -> Result<SectionConfig, Error> {
        Ok(SectionConfig {
            enabled: config.enabled(section),
            refresh_interval: config.refresh_interval(section),
            builder: registry.get(section)?,
        })
    }
}

impl fmt::Debug for SectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionConfig")
            .field("enabled", &self.enabled)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}
