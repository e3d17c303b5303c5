//! Content builders for the four published sections.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::api::ApiClient;
use crate::config::{Config, EMPTY_EMBED, GamestateConfig, ServerNameStyle};
use crate::content::{BuilderRegistry, ContentBuilder, Embed, Rendered};
use crate::error::BuildError;
use crate::section::{Job, Section};

/// Layer id reported by the game server between two matches.
const BETWEEN_MATCHES: &str = "Untitled";
const MAP_PICTURES: &str = "maps/";

/// Registry with a builder for every section.
pub fn registry() -> BuilderRegistry {
    BuilderRegistry::new()
        .with(Section::Header, HeaderBuilder)
        .with(Section::Gamestate, GamestateBuilder)
        .with(Section::MapRotation, MapRotationBuilder)
        .with(Section::PlayerStats, PlayerStatsBuilder)
}

async fn fetch<T: DeserializeOwned>(api: &ApiClient, endpoint: &str) -> Result<T, BuildError> {
    let result = api.call(endpoint, Value::Null).await?;
    decode(endpoint, result)
}

fn decode<T: DeserializeOwned>(
    endpoint: &str,
    result: Map<String, Value>,
) -> Result<T, BuildError> {
    serde_json::from_value(Value::Object(result))
        .map_err(|e| BuildError::parse(endpoint, e.to_string()))
}

/// Wrapper for endpoints whose result is a bare scalar or list.
#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ServerName {
    name: String,
    short_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Faction {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MapInfo {
    allies: Option<Faction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LayerRepr {
    Id(String),
    Full {
        id: String,
        pretty_name: Option<String>,
        image_name: Option<String>,
        map: Option<MapInfo>,
    },
}

/// A map layer, from either the legacy string form or the structured form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "LayerRepr")]
pub struct Layer {
    pub id: String,
    pub pretty_name: String,
    pub image_name: Option<String>,
    pub allies: Option<String>,
}

impl From<LayerRepr> for Layer {
    fn from(repr: LayerRepr) -> Self {
        match repr {
            LayerRepr::Id(id) => Layer {
                pretty_name: id.clone(),
                id,
                image_name: None,
                allies: None,
            },
            LayerRepr::Full {
                id,
                pretty_name,
                image_name,
                map,
            } => Layer {
                pretty_name: pretty_name.unwrap_or_else(|| id.clone()),
                id,
                image_name,
                allies: map.and_then(|m| m.allies).map(|f| f.name.to_lowercase()),
            },
        }
    }
}

impl Layer {
    fn is_between_matches(&self) -> bool {
        self.id == BETWEEN_MATCHES
    }

    fn picture_url(&self, config: &Config) -> Option<String> {
        if self.is_between_matches() {
            return None;
        }
        let image = self.image_name.clone().unwrap_or_else(|| {
            let base = self.id.split('_').next().unwrap_or(&self.id);
            format!("{}.webp", base.to_lowercase())
        });
        config
            .api
            .base_server_url
            .join(&format!("{MAP_PICTURES}{image}"))
            .ok()
            .map(String::from)
    }
}

#[derive(Debug, Deserialize)]
struct Gamestate {
    num_allied_players: u32,
    num_axis_players: u32,
    allied_score: u32,
    axis_score: u32,
    raw_time_remaining: Option<String>,
    time_remaining: Option<f64>,
    current_map: Layer,
    next_map: Layer,
}

impl Gamestate {
    fn time_remaining(&self) -> String {
        if let Some(raw) = &self.raw_time_remaining {
            return raw.clone();
        }
        // Seconds are whole and non-negative in practice
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let secs = self.time_remaining.unwrap_or_default().max(0.0) as u64;
        format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
    }

    fn score(&self, display: &GamestateConfig) -> String {
        let specific = match self.current_map.allies.as_deref() {
            Some("us") => display.score_format_ger_us.as_ref(),
            Some("rus") => display.score_format_ger_rus.as_ref(),
            Some("gb") => display.score_format_ger_uk.as_ref(),
            _ => None,
        };
        specific
            .unwrap_or(&display.score_format)
            .replace("{allied}", &self.allied_score.to_string())
            .replace("{axis}", &self.axis_score.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SlotsRepr {
    Text(Wrapped<String>),
    Counts {
        current_players: u32,
        max_players: u32,
    },
}

fn parse_slots(result: Map<String, Value>) -> Result<(u32, u32), BuildError> {
    match decode("get_slots", result)? {
        SlotsRepr::Counts {
            current_players,
            max_players,
        } => Ok((current_players, max_players)),
        SlotsRepr::Text(Wrapped { result }) => {
            let parsed = result
                .split_once('/')
                .and_then(|(a, b)| Some((a.trim().parse().ok()?, b.trim().parse().ok()?)));
            parsed.ok_or_else(|| {
                BuildError::parse("get_slots", format!("invalid slots {result:?}"))
            })
        }
    }
}

/// Guesses where the current map sits in the rotation.
///
/// A map may appear more than once. Then the occurrences of the current map
/// that directly precede an occurrence of the next map are returned, or every
/// occurrence of the current map if none does.
pub fn current_map_positions(rotation: &[Layer], current: &Layer, next: &Layer) -> Vec<usize> {
    if current.is_between_matches() {
        return Vec::new();
    }

    let occurrences: Vec<usize> = positions_of(rotation, current);
    if let [only] = occurrences[..] {
        return vec![only];
    }

    let preceding: Vec<usize> = positions_of(rotation, next)
        .into_iter()
        .map(|idx| idx.checked_sub(1).unwrap_or(rotation.len() - 1))
        .filter(|idx| rotation[*idx].id == current.id)
        .collect();
    if preceding.is_empty() {
        occurrences
    } else {
        preceding
    }
}

pub fn next_map_positions(current_positions: &[usize], rotation_len: usize) -> Vec<usize> {
    current_positions
        .iter()
        .map(|&position| (position + 1) % rotation_len)
        .collect()
}

fn positions_of(rotation: &[Layer], layer: &Layer) -> Vec<usize> {
    rotation
        .iter()
        .enumerate()
        .filter(|(_, l)| l.id == layer.id)
        .map(|(idx, _)| idx)
        .collect()
}

pub struct HeaderBuilder;

#[async_trait]
impl ContentBuilder for HeaderBuilder {
    async fn build(
        &self,
        _job: &Job,
        config: &Config,
        api: &ApiClient,
    ) -> Result<Rendered, BuildError> {
        let display = &config.display.header;
        let server_name: ServerName = fetch(api, "get_status").await?;

        let mut embed = Embed {
            title: Some(match display.server_name {
                ServerNameStyle::Name => server_name.name,
                ServerNameStyle::ShortName => server_name.short_name,
            }),
            ..Embed::default()
        };

        if let Some(url) = &display.quick_connect_url {
            embed.add_field(&display.quick_connect_name, url, false);
        }
        if let Some(url) = &display.battlemetrics_url {
            embed.add_field(&display.battlemetrics_name, url, false);
        }

        for option in &display.embeds {
            let endpoint = match option.value.as_str() {
                "reserved_vip_slots" => "get_vip_slots_num",
                _ => "get_vips_count",
            };
            let count: Wrapped<i64> = fetch(api, endpoint).await?;
            embed.add_field(&option.name, count.result.to_string(), option.inline);
        }

        embed.apply_footer(&display.footer);
        Ok(Rendered::embed(embed))
    }
}

pub struct GamestateBuilder;

#[async_trait]
impl ContentBuilder for GamestateBuilder {
    async fn build(
        &self,
        _job: &Job,
        config: &Config,
        api: &ApiClient,
    ) -> Result<Rendered, BuildError> {
        let display = &config.display.gamestate;
        let gamestate: Gamestate = fetch(api, "get_gamestate").await?;

        let mut embed = Embed::default();
        if display.image {
            if let Some(url) = gamestate.current_map.picture_url(config) {
                embed.set_image(url);
            }
        }

        for option in &display.embeds {
            let value = match option.value.as_str() {
                "slots" => {
                    let (players, max) = parse_slots(api.call("get_slots", Value::Null).await?)?;
                    format!("{players}/{max}")
                }
                "score" => gamestate.score(display),
                "current_map" => gamestate.current_map.pretty_name.clone(),
                "next_map" => gamestate.next_map.pretty_name.clone(),
                "time_remaining" => gamestate.time_remaining(),
                "num_allied_players" => gamestate.num_allied_players.to_string(),
                "num_axis_players" => gamestate.num_axis_players.to_string(),
                _ => EMPTY_EMBED.to_string(),
            };
            embed.add_field(&option.name, value, option.inline);
        }

        embed.apply_footer(&display.footer);
        Ok(Rendered::embed(embed))
    }
}

pub struct MapRotationBuilder;

#[async_trait]
impl ContentBuilder for MapRotationBuilder {
    async fn build(
        &self,
        job: &Job,
        config: &Config,
        api: &ApiClient,
    ) -> Result<Rendered, BuildError> {
        let display = &config.display.map_rotation;
        let rotation: Wrapped<Vec<Layer>> = fetch(api, "get_map_rotation").await?;
        let rotation = rotation.result;
        let gamestate: Gamestate = fetch(api, "get_gamestate").await?;

        let current =
            current_map_positions(&rotation, &gamestate.current_map, &gamestate.next_map);
        let next = next_map_positions(&current, rotation.len());
        debug!("{job} current map positions {current:?}, next map positions {next:?}");

        let mut lines: Vec<String> = rotation
            .iter()
            .enumerate()
            .map(|(idx, layer)| {
                let format = if current.contains(&idx) {
                    &display.current_map
                } else if next.contains(&idx) {
                    &display.next_map
                } else {
                    &display.other_map
                };
                format
                    .replace("{map}", &layer.pretty_name)
                    .replace("{position}", &(idx + 1).to_string())
            })
            .collect();
        if display.display_legend {
            lines.push(display.legend.clone());
        }

        let mut embed = Embed {
            title: display.display_title.then(|| display.title.clone()),
            description: Some(lines.join("\n")),
            ..Embed::default()
        };
        embed.apply_footer(&display.footer);
        Ok(Rendered::embed(embed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatKind {
    Kills,
    KillsPerMinute,
    Deaths,
    DeathsPerMinute,
    KillDeathRatio,
    KillStreak,
    DeathStreak,
    TeamKills,
    TeamKillStreak,
    LongestLife,
    ShortestLife,
}

impl StatKind {
    fn from_key(key: &str) -> Option<StatKind> {
        Some(match key {
            "highest_kills" => StatKind::Kills,
            "kills_per_minute" => StatKind::KillsPerMinute,
            "highest_deaths" => StatKind::Deaths,
            "deaths_per_minute" => StatKind::DeathsPerMinute,
            "highest_kdr" => StatKind::KillDeathRatio,
            "kill_streak" => StatKind::KillStreak,
            "death_streak" => StatKind::DeathStreak,
            "highest_team_kills" => StatKind::TeamKills,
            "team_kill_streak" => StatKind::TeamKillStreak,
            "longest_life" => StatKind::LongestLife,
            "shortest_life" => StatKind::ShortestLife,
            _ => return None,
        })
    }

    fn is_rate(self) -> bool {
        matches!(
            self,
            StatKind::KillsPerMinute | StatKind::DeathsPerMinute | StatKind::KillDeathRatio
        )
    }
}

#[derive(Debug, Deserialize)]
struct PlayerStats {
    player: String,
    #[serde(default)]
    kills: f64,
    #[serde(default)]
    kills_per_minute: f64,
    #[serde(default)]
    deaths: f64,
    #[serde(default)]
    deaths_per_minute: f64,
    #[serde(default)]
    kill_death_ratio: f64,
    #[serde(default)]
    kills_streak: f64,
    #[serde(default)]
    deaths_without_kill_streak: f64,
    #[serde(default)]
    teamkills: f64,
    #[serde(default)]
    teamkills_streak: f64,
    #[serde(default)]
    longest_life_secs: f64,
    #[serde(default)]
    shortest_life_secs: f64,
}

impl PlayerStats {
    fn stat(&self, kind: StatKind) -> f64 {
        match kind {
            StatKind::Kills => self.kills,
            StatKind::KillsPerMinute => self.kills_per_minute,
            StatKind::Deaths => self.deaths,
            StatKind::DeathsPerMinute => self.deaths_per_minute,
            StatKind::KillDeathRatio => self.kill_death_ratio,
            StatKind::KillStreak => self.kills_streak,
            StatKind::DeathStreak => self.deaths_without_kill_streak,
            StatKind::TeamKills => self.teamkills,
            StatKind::TeamKillStreak => self.teamkills_streak,
            StatKind::LongestLife => self.longest_life_secs,
            StatKind::ShortestLife => self.shortest_life_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LiveStats {
    stats: Vec<PlayerStats>,
}

fn leaderboard(stats: &mut [PlayerStats], kind: StatKind, limit: usize) -> String {
    stats.sort_by(|a, b| {
        let order = a.stat(kind).total_cmp(&b.stat(kind));
        if kind == StatKind::ShortestLife {
            order
        } else {
            order.reverse()
        }
    });

    let lines: Vec<String> = stats
        .iter()
        .take(limit)
        .enumerate()
        .map(|(idx, stat)| {
            let value = if kind.is_rate() {
                format!("{:.1}", stat.stat(kind))
            } else {
                format!("{:.0}", stat.stat(kind))
            };
            format!("[#{}][{}]: {value}", idx + 1, stat.player)
        })
        .collect();
    format!("```md\n{}\n```", lines.join("\n"))
}

pub struct PlayerStatsBuilder;

#[async_trait]
impl ContentBuilder for PlayerStatsBuilder {
    async fn build(
        &self,
        _job: &Job,
        config: &Config,
        api: &ApiClient,
    ) -> Result<Rendered, BuildError> {
        let display = &config.display.player_stats;
        let mut live: LiveStats = fetch(api, "get_live_game_stats").await?;

        let mut embed = Embed {
            title: display.display_title.then(|| display.title.clone()),
            ..Embed::default()
        };
        for option in &display.embeds {
            let value = match StatKind::from_key(&option.value) {
                Some(kind) => leaderboard(&mut live.stats, kind, display.num_to_display),
                None => EMPTY_EMBED.to_string(),
            };
            embed.add_field(&option.name, value, option.inline);
        }

        embed.apply_footer(&display.footer);
        Ok(Rendered::embed(embed))
    }
}
