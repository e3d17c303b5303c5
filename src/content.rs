//! Renderable payloads and the builder seam that produces them.

use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

use crate::api::ApiClient;
use crate::config::{Config, FooterConfig};
use crate::error::{BuildError, Error};
use crate::section::{Job, Section};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Structured webhook embed, serialized in the Discord embed shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Embed {
    pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
    }

    pub fn set_image(&mut self, url: impl Into<String>) {
        self.image = Some(EmbedImage { url: url.into() });
    }

    pub fn apply_footer(&mut self, footer: &FooterConfig) {
        if !footer.enabled {
            return;
        }
        let text = format!("{}{}", footer.footer_text, footer.last_refresh_text);
        if !text.is_empty() {
            self.footer = Some(EmbedFooter { text });
        }
        if footer.include_timestamp {
            self.timestamp = Some(chrono::Utc::now().to_rfc3339());
        }
    }
}

/// What a builder produced for one tick: message text, an embed, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    pub content: Option<String>,
    pub embed: Option<Embed>,
}

impl Rendered {
    pub fn embed(embed: Embed) -> Self {
        Rendered {
            content: None,
            embed: Some(embed),
        }
    }

    pub fn text(content: String) -> Self {
        Rendered {
            content: Some(content),
            embed: None,
        }
    }
}

/// Turns the current server state into a renderable payload.
///
/// Builders are called once per tick and must not keep state between calls.
#[async_trait]
pub trait ContentBuilder: Send + Sync {
    async fn build(
        &self,
        job: &Job,
        config: &Config,
        api: &ApiClient,
    ) -> Result<Rendered, BuildError>;
}

/// Lookup table from section to the builder that renders it.
#[derive(Clone, Default)]
pub struct BuilderRegistry {
    builders: HashMap<Section, Arc<dyn ContentBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, section: Section, builder: impl ContentBuilder + 'static) -> Self {
        self.builders.insert(section, Arc::new(builder));
        self
    }

    pub fn get(&self, section: Section) -> Result<Arc<dyn ContentBuilder>, Error> {
        self.builders
            .get(&section)
            .cloned()
            .ok_or(Error::MissingBuilder(section.key()))
    }

    /// Fails unless every known section has a builder.
    pub fn check_complete(&self) -> Result<(), Error> {
        Section::ALL
            .into_iter()
            .try_for_each(|section| self.get(section).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blank;

    #[async_trait]
    impl ContentBuilder for Blank {
        async fn build(
            &self,
            _: &Job,
            _: &Config,
            _: &ApiClient,
        ) -> Result<Rendered, BuildError> {
            Ok(Rendered::default())
        }
    }

    #[test]
    fn test_incomplete_registry_is_reported() {
        let registry = BuilderRegistry::new()
            .with(Section::Header, Blank)
            .with(Section::Gamestate, Blank);

        assert!(matches!(
            registry.check_complete(),
            Err(Error::MissingBuilder("map_rotation"))
        ));

        let registry = registry
            .with(Section::MapRotation, Blank)
            .with(Section::PlayerStats, Blank);
        assert!(registry.check_complete().is_ok());
    }

    #[test]
    fn test_footer_is_skipped_when_disabled() {
        let mut embed = Embed::default();
        embed.apply_footer(&FooterConfig {
            enabled: false,
            footer_text: "ignored".to_string(),
            include_timestamp: true,
            last_refresh_text: String::new(),
        });
        assert_eq!(embed, Embed::default());
    }

    #[test]
    fn test_embed_serializes_without_empty_parts() {
        let mut embed = Embed {
            title: Some("Alpha".to_string()),
            ..Embed::default()
        };
        embed.add_field("Players", "50/100", true);

        let json = serde_json::to_value(&embed).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "title": "Alpha",
                "fields": [{"name": "Players", "value": "50/100", "inline": true}]
            })
        );
    }
}
