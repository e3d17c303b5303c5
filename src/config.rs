use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::error::ConfigError;
use crate::section::Section;

/// Placeholder value for a blank embed field.
pub const EMPTY_EMBED: &str = "\u{200B}";

const HEADER_EMBEDS: &[&str] = &["reserved_vip_slots", "current_vips"];
const GAMESTATE_EMBEDS: &[&str] = &[
    "num_allied_players",
    "num_axis_players",
    "slots",
    "score",
    "time_remaining",
    "current_map",
    "next_map",
    EMPTY_EMBED,
];
const PLAYER_STATS_EMBEDS: &[&str] = &[
    "highest_kills",
    "kills_per_minute",
    "highest_deaths",
    "deaths_per_minute",
    "highest_kdr",
    "kill_streak",
    "death_streak",
    "highest_team_kills",
    "team_kill_streak",
    "longest_life",
    "shortest_life",
    EMPTY_EMBED,
];
const MAX_PLAYER_STATS: usize = 25;

/// A snapshot of one server's config file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub settings: Settings,
    #[serde(default)]
    pub output: OutputConfig,
    pub discord: DiscordConfig,
    pub api: ApiConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub time_between_config_file_reads: u64,
    pub disabled_section_sleep_timer: u64,
}

impl Settings {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.time_between_config_file_reads)
    }

    pub fn disabled_sleep(&self) -> Duration {
        Duration::from_secs(self.disabled_section_sleep_timer)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    pub message_id_directory: Option<PathBuf>,
    pub message_id_filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: Url,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_server_url: Url,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FooterConfig {
    pub enabled: bool,
    #[serde(default)]
    pub footer_text: String,
    #[serde(default)]
    pub include_timestamp: bool,
    #[serde(default)]
    pub last_refresh_text: String,
}

/// One configurable embed field: a display `name` and the statistic `value` it shows.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbedOption {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerNameStyle {
    Name,
    ShortName,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    pub header: HeaderConfig,
    pub gamestate: GamestateConfig,
    pub map_rotation: MapRotationConfig,
    pub player_stats: PlayerStatsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderConfig {
    pub enabled: bool,
    pub time_between_refreshes: u64,
    pub server_name: ServerNameStyle,
    #[serde(default = "default_quick_connect_name")]
    pub quick_connect_name: String,
    pub quick_connect_url: Option<String>,
    #[serde(default = "default_battlemetrics_name")]
    pub battlemetrics_name: String,
    pub battlemetrics_url: Option<String>,
    #[serde(default)]
    pub embeds: Vec<EmbedOption>,
    #[serde(default)]
    pub footer: FooterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GamestateConfig {
    pub enabled: bool,
    pub time_between_refreshes: u64,
    #[serde(default)]
    pub image: bool,
    #[serde(default = "default_score_format")]
    pub score_format: String,
    pub score_format_ger_us: Option<String>,
    pub score_format_ger_rus: Option<String>,
    pub score_format_ger_uk: Option<String>,
    #[serde(default)]
    pub embeds: Vec<EmbedOption>,
    #[serde(default)]
    pub footer: FooterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapRotationConfig {
    pub enabled: bool,
    pub time_between_refreshes: u64,
    #[serde(default)]
    pub display_title: bool,
    #[serde(default)]
    pub title: String,
    pub current_map: String,
    pub next_map: String,
    pub other_map: String,
    #[serde(default)]
    pub display_legend: bool,
    #[serde(default)]
    pub legend: String,
    #[serde(default)]
    pub footer: FooterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerStatsConfig {
    pub enabled: bool,
    pub time_between_refreshes: u64,
    #[serde(default)]
    pub display_title: bool,
    #[serde(default)]
    pub title: String,
    pub num_to_display: usize,
    #[serde(default)]
    pub embeds: Vec<EmbedOption>,
    #[serde(default)]
    pub footer: FooterConfig,
}

fn default_quick_connect_name() -> String {
    "Quick Connect".to_string()
}

fn default_battlemetrics_name() -> String {
    "BattleMetrics Page".to_string()
}

fn default_score_format() -> String {
    "Allied {allied} : Axis {axis}".to_string()
}

impl Config {
    /// Reads, parses and validates a server config file.
    ///
    /// When neither `api.api_key` nor a username/password pair is present the
    /// `HLL_STATUS_API_KEY` environment variable (or `.env` entry) is used.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Same as [`Config::load`] without blocking the runtime.
    pub async fn read<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(content)?;

        if config.api.api_key.is_none() && !config.api.has_login() {
            config.api.api_key = dotenvy::var("HLL_STATUS_API_KEY").ok();
        }

        // Url::join drops the last path segment unless the base ends with a slash
        if !config.api.base_server_url.path().ends_with('/') {
            let path = format!("{}/", config.api.base_server_url.path());
            config.api.base_server_url.set_path(&path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        check_interval(
            "settings.time_between_config_file_reads",
            self.settings.time_between_config_file_reads,
        )?;
        check_interval(
            "settings.disabled_section_sleep_timer",
            self.settings.disabled_section_sleep_timer,
        )?;
        for section in Section::ALL {
            let field = format!("display.{}.time_between_refreshes", section.key());
            check_interval(&field, self.refresh_secs(section))?;
        }

        if self.api.api_key.as_deref().is_none_or(str::is_empty) && !self.api.has_login() {
            return Err(ConfigError::invalid(
                "api",
                "an api_key or a username and password is required",
            ));
        }

        let header = &mut self.display.header;
        header.quick_connect_url = non_empty(header.quick_connect_url.take());
        header.battlemetrics_url = non_empty(header.battlemetrics_url.take());
        for url in [&header.quick_connect_url, &header.battlemetrics_url]
            .into_iter()
            .flatten()
        {
            Url::parse(url)?;
        }
        check_options("display.header.embeds", &header.embeds, HEADER_EMBEDS)?;
        check_options(
            "display.gamestate.embeds",
            &self.display.gamestate.embeds,
            GAMESTATE_EMBEDS,
        )?;
        check_options(
            "display.player_stats.embeds",
            &self.display.player_stats.embeds,
            PLAYER_STATS_EMBEDS,
        )?;

        let shown = self.display.player_stats.num_to_display;
        if !(1..=MAX_PLAYER_STATS).contains(&shown) {
            return Err(ConfigError::invalid(
                "display.player_stats.num_to_display",
                format!("{shown} is not between 1 and {MAX_PLAYER_STATS}"),
            ));
        }

        Ok(())
    }

    pub fn enabled(&self, section: Section) -> bool {
        match section {
            Section::Header => self.display.header.enabled,
            Section::Gamestate => self.display.gamestate.enabled,
            Section::MapRotation => self.display.map_rotation.enabled,
            Section::PlayerStats => self.display.player_stats.enabled,
        }
    }

    fn refresh_secs(&self, section: Section) -> u64 {
        match section {
            Section::Header => self.display.header.time_between_refreshes,
            Section::Gamestate => self.display.gamestate.time_between_refreshes,
            Section::MapRotation => self.display.map_rotation.time_between_refreshes,
            Section::PlayerStats => self.display.player_stats.time_between_refreshes,
        }
    }

    pub fn refresh_interval(&self, section: Section) -> Duration {
        Duration::from_secs(self.refresh_secs(section))
    }

    /// Where the message ids of `server` are persisted.
    pub fn message_id_path(&self, server: &str) -> PathBuf {
        let dir = self
            .output
            .message_id_directory
            .clone()
            .unwrap_or_else(default_messages_dir);
        let filename = self
            .output
            .message_id_filename
            .clone()
            .unwrap_or_else(|| format!("{server}.toml"));
        dir.join(filename)
    }
}

impl ApiConfig {
    pub fn has_login(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

fn check_interval(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs < 1 {
        return Err(ConfigError::invalid(field, "must be at least 1 second"));
    }
    Ok(())
}

fn check_options(
    field: &str,
    options: &[EmbedOption],
    allowed: &[&str],
) -> Result<(), ConfigError> {
    match options.iter().find(|o| !allowed.contains(&o.value.as_str())) {
        Some(option) => Err(ConfigError::invalid(
            field,
            format!("unknown embed value {:?}", option.value),
        )),
        None => Ok(()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// A server config file discovered in the config directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFile {
    /// File stem, used as the server identifier everywhere.
    pub server: String,
    pub path: PathBuf,
}

/// Lists every `*.toml` file in `dir`, sorted by server identifier.
pub fn discover_servers<P: AsRef<Path>>(dir: P) -> Result<Vec<ServerFile>, ConfigError> {
    let mut servers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "toml") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            servers.push(ServerFile {
                server: stem.to_string(),
                path: path.clone(),
            });
        }
    }
    servers.sort_by(|a, b| a.server.cmp(&b.server));
    Ok(servers)
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = dotenvy::var("HLL_STATUS_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().map_or_else(|| PathBuf::from("config"), |d| d.join("hll_status"))
}

pub fn default_messages_dir() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("messages"),
        |d| d.join("hll_status").join("messages"),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Config;

    pub const SAMPLE: &str = r#"
        [settings]
        time_between_config_file_reads = 30
        disabled_section_sleep_timer = 60

        [discord]
        webhook_url = "https://discord.com/api/webhooks/1234567890/abcdefg"

        [api]
        base_server_url = "https://rcon.example.com"
        api_key = "secret"

        [display.header]
        enabled = true
        time_between_refreshes = 5
        server_name = "name"
        quick_connect_url = ""
        battlemetrics_url = "https://www.battlemetrics.com/servers/hll/1"
        embeds = [{ name = "VIPs", value = "current_vips", inline = true }]

        [display.header.footer]
        enabled = true
        footer_text = "Powered by CRCON"
        include_timestamp = true

        [display.gamestate]
        enabled = true
        time_between_refreshes = 5
        image = true
        score_format_ger_rus = "Soviets {allied} : Germans {axis}"
        embeds = [
            { name = "Allied", value = "num_allied_players", inline = true },
            { name = "Score", value = "score" },
            { name = "Map", value = "current_map" },
        ]

        [display.map_rotation]
        enabled = false
        time_between_refreshes = 10
        current_map = "🟩 {position}. **{map}**"
        next_map = "🟨 {position}. {map}"
        other_map = "⬛ {position}. {map}"

        [display.player_stats]
        enabled = true
        time_between_refreshes = 20
        num_to_display = 3
        embeds = [{ name = "Kills", value = "highest_kills" }]
    "#;

    pub fn sample() -> Config {
        Config::parse(SAMPLE).expect("sample config must be valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_toml() {
        let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
        write!(temp_file, "{}", test_support::SAMPLE).expect("Failed to write to temp file");

        let config = Config::load(temp_file.path()).expect("Failed to parse config");

        assert_eq!(config.settings.reload_interval(), Duration::from_secs(30));
        assert_eq!(config.settings.disabled_sleep(), Duration::from_secs(60));
        assert_eq!(config.api.base_server_url.as_str(), "https://rcon.example.com/");
        assert_eq!(config.display.header.server_name, ServerNameStyle::Name);
        assert_eq!(config.display.header.quick_connect_url, None);
        assert!(config.enabled(Section::Header));
        assert!(!config.enabled(Section::MapRotation));
        assert_eq!(
            config.refresh_interval(Section::PlayerStats),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn test_zero_refresh_interval_is_rejected() {
        let toml = test_support::SAMPLE.replace(
            "time_between_refreshes = 20",
            "time_between_refreshes = 0",
        );
        match Config::parse(&toml) {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "display.player_stats.time_between_refreshes");
            }
            other => panic!("Expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_embed_value_is_rejected() {
        let toml = test_support::SAMPLE.replace("\"current_vips\"", "\"favourite_colour\"");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::Invalid { field, .. }) if field == "display.header.embeds"
        ));
    }

    #[test]
    fn test_header_links_must_be_urls() {
        let toml = test_support::SAMPLE.replace(
            "quick_connect_url = \"\"",
            "quick_connect_url = \"not a url\"",
        );
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::UrlParse(_))
        ));

        let toml = test_support::SAMPLE.replace(
            "quick_connect_url = \"\"",
            "quick_connect_url = \"steam://connect/203.0.113.7:27015\"",
        );
        let config = Config::parse(&toml).unwrap();
        assert_eq!(
            config.display.header.quick_connect_url.as_deref(),
            Some("steam://connect/203.0.113.7:27015")
        );
    }

    #[test]
    fn test_num_to_display_bounds() {
        let toml = test_support::SAMPLE.replace("num_to_display = 3", "num_to_display = 26");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(
            Config::parse("[settings\nbroken"),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_message_id_path_honours_output_settings() {
        let mut config = test_support::sample();
        config.output.message_id_directory = Some(PathBuf::from("/srv/ids"));
        assert_eq!(
            config.message_id_path("alpha"),
            PathBuf::from("/srv/ids/alpha.toml")
        );

        config.output.message_id_filename = Some("shared.toml".to_string());
        assert_eq!(
            config.message_id_path("alpha"),
            PathBuf::from("/srv/ids/shared.toml")
        );
    }

    #[test]
    fn test_discover_servers_only_lists_toml_files() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(dir.path().join("bravo.toml"), "").unwrap();
        fs::write(dir.path().join("alpha.toml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let servers = discover_servers(dir.path()).unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.server.as_str()).collect();
        assert_eq!(names, ["alpha", "bravo"]);
    }
}
