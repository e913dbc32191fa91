use anyhow::{Context, Result, bail};
use convo_sync::{Credential, Endpoints, SyncClient, TurnRules, ViewConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [oracle]
//                    endpoint = "http://localhost:3000/api/smart-scrollback"
//
//   env var:         CONVO_ORACLE__ENDPOINT=...   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
    #[serde(default)]
    pub oracle: OracleFileConfig,
    #[serde(default)]
    pub anchor: AnchorFileConfig,
    #[serde(default)]
    pub turn: TurnFileConfig,
}

/// Backend location (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for HistoryFileConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

/// Relevance oracle (lives under `[oracle]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_oracle_endpoint")]
    pub endpoint: String,
    /// 0 = no timeout
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

impl Default for OracleFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_oracle_endpoint(),
            timeout_secs: default_oracle_timeout_secs(),
            context_window: default_context_window(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorFileConfig {
    #[serde(default = "default_highlight_ms")]
    pub highlight_ms: u64,
}

impl Default for AnchorFileConfig {
    fn default() -> Self {
        Self {
            highlight_ms: default_highlight_ms(),
        }
    }
}

/// Turn detection conventions (lives under `[turn]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnFileConfig {
    #[serde(default = "default_human_alias")]
    pub human_alias: String,
    #[serde(default = "default_orchestrator_alias")]
    pub orchestrator_alias: String,
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
}

impl Default for TurnFileConfig {
    fn default() -> Self {
        Self {
            human_alias: default_human_alias(),
            orchestrator_alias: default_orchestrator_alias(),
            completion_marker: default_completion_marker(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_ws_url() -> String {
    "ws://localhost:8000".to_string()
}
fn default_page_size() -> usize {
    convo_sync::PAGE_SIZE
}
fn default_true() -> bool {
    true
}
fn default_oracle_endpoint() -> String {
    "http://localhost:3000/api/smart-scrollback".to_string()
}
fn default_oracle_timeout_secs() -> u64 {
    10
}
fn default_context_window() -> usize {
    convo_sync::oracle::CONTEXT_WINDOW
}
fn default_highlight_ms() -> u64 {
    convo_sync::HIGHLIGHT_DURATION.as_millis() as u64
}
fn default_human_alias() -> String {
    convo_sync::types::HUMAN_ALIAS.to_string()
}
fn default_orchestrator_alias() -> String {
    convo_sync::types::ORCHESTRATOR_ALIAS.to_string()
}
fn default_completion_marker() -> String {
    convo_sync::types::COMPLETION_MARKER.to_string()
}

/// Build a figment that layers: defaults → config.toml → CONVO_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CONVO_AUTH__TOKEN=...`  →  `auth.token = "..."`
///   `CONVO_HISTORY__PAGE_SIZE=20`  →  `history.page_size = 20`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CONVO_").split("__"))
}

impl FileConfig {
    pub fn credential(&self) -> Result<Credential> {
        match self.auth.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(Credential::bearer(token)),
            _ => bail!(
                "No auth token configured. Set [auth] token in config.toml, \
                 CONVO_AUTH__TOKEN, or pass --token"
            ),
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        let endpoints = Endpoints::new(&self.server.api_url, &self.server.ws_url);
        if !self.oracle.enabled {
            return endpoints;
        }
        let timeout = if self.oracle.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.oracle.timeout_secs))
        };
        endpoints.with_oracle(&self.oracle.endpoint, timeout)
    }

    pub fn view_config(&self) -> ViewConfig {
        ViewConfig {
            page_size: self.history.page_size.max(1),
            context_window: self.oracle.context_window,
            highlight_for: Duration::from_millis(self.anchor.highlight_ms),
            turn_rules: TurnRules {
                human_alias: self.turn.human_alias.clone(),
                orchestrator_alias: self.turn.orchestrator_alias.clone(),
                completion_marker: self.turn.completion_marker.clone(),
            },
        }
    }

    pub fn client(&self) -> Result<SyncClient> {
        Ok(SyncClient::new(self.endpoints(), self.credential()?))
    }

    /// Copy safe to print: the token is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.auth.token.is_some() {
            copy.auth.token = Some("********".to_string());
        }
        copy
    }
}

// =============================================================================
// Directory layout (not tunable via figment; set by --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ConvoConfig {
    pub data_dir: PathBuf,
}

impl ConvoConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".convo"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
        debug!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Resolve the file config, with a command-line token taking priority.
    pub fn resolve(&self, token: Option<String>) -> Result<FileConfig> {
        let mut fc: FileConfig = load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))?;
        if let Some(token) = token {
            fc.auth.token = Some(token);
        }
        Ok(fc)
    }
}
