use crate::chat::ChatDestination;
use crate::platform::Moderator;
use crate::tracker::WatermarkPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Start with every external write suppressed. Can be toggled at runtime.
    pub dry_run: bool,
    /// Communities to watch. Each one gets its own workers.
    pub monitored: Vec<String>,
    /// Where exceptions and the startup message are posted.
    pub error_chat: Option<ChatDestination>,
    /// Chat webhooks keyed by `server/channel`.
    pub chat_webhooks: BTreeMap<String, String>,
    pub dispatch: DispatchConfig,
    pub supervisor: SupervisorConfig,
    pub classifier: ClassifierConfig,
    pub modmail: ModmailConfig,
    pub watermark_policy: WatermarkPolicy,
    /// Directory holding one JSON-lines audit file per sheet.
    pub audit_dir: String,
    /// Unix socket accepting operator commands (`!status`, `!dryrun 0|1`).
    pub control_socket: Option<String>,
    pub toxicity: Option<ToxicityConfig>,
    pub feeds: FeedsConfig,
    /// Settings for communities without their own entry.
    pub default_community: Community,
    pub communities: BTreeMap<String, Community>,
    /// Moderator lists served by the offline platform adapter.
    pub offline_moderators: BTreeMap<String, Vec<Moderator>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Community {
    /// Filled in from the registry key; ignored in the file.
    #[serde(skip)]
    pub name: String,
    pub mirror_board: Option<String>,
    pub removals_board: Option<String>,
    pub removals_chat: Option<ChatDestination>,
    pub bans_chat: Option<ChatDestination>,
    pub shadowbans_chat: Option<ChatDestination>,
    /// Moderators with exactly these permissions are comment moderators.
    pub comment_mod_permissions: Vec<String>,
    pub comment_mod_whitelist: Vec<String>,
    pub features: Features,
    pub audit_sheet: Option<String>,
    /// Flair text containing this (case-insensitive) triggers the flair helper.
    pub flair_violation_marker: String,
    pub toxicity_threshold: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub modmail: bool,
    pub toxicity: bool,
    pub audit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub write_spacing_secs: u64,
    pub acknowledge_spacing_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_delay_secs: u64,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Automated accounts whose actions are ignored entirely.
    pub ignored_actors: Vec<String>,
    /// Accounts whose actions are never written to the audit trail.
    pub audit_excluded_actors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModmailConfig {
    pub support_bots: Vec<String>,
    pub automated_note_actors: Vec<String>,
    pub removal_keywords: Vec<String>,
    pub qualifying_note_actions: Vec<String>,
    pub note_window_days: i64,
    pub reply_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToxicityConfig {
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_toxicity_timeout")]
    pub timeout_seconds: u64,
}

fn default_toxicity_timeout() -> u64 {
    10
}

/// JSON-lines feed files, looked up as `<dir>/<community>/<category>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub dir: String,
    /// How many trailing items a fresh subscription replays.
    pub backlog: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no communities are monitored")]
    NothingMonitored,
    #[error("community {community}: {message}")]
    InvalidCommunity { community: String, message: String },
    #[error("dispatch: {0}")]
    InvalidDispatch(String),
}

impl Default for Config {
    fn default() -> Self {
        let mut communities = BTreeMap::new();
        communities.insert(
            "collapse".to_string(),
            Community {
                mirror_board: Some("collapse_wilds".to_string()),
                removals_board: Some("collapseremovals".to_string()),
                removals_chat: Some(ChatDestination::new("Collapse Moderators", "fm-general")),
                comment_mod_whitelist: vec![
                    "CollapseBot".to_string(),
                    "StatementBot".to_string(),
                    "CollapseTesting".to_string(),
                ],
                features: Features {
                    modmail: true,
                    toxicity: false,
                    audit: true,
                },
                audit_sheet: Some("collapse".to_string()),
                ..Community::default()
            },
        );

        Config {
            dry_run: false,
            monitored: vec!["collapse".to_string()],
            error_chat: None,
            chat_webhooks: BTreeMap::new(),
            dispatch: DispatchConfig::default(),
            supervisor: SupervisorConfig::default(),
            classifier: ClassifierConfig::default(),
            modmail: ModmailConfig::default(),
            watermark_policy: WatermarkPolicy::Static,
            audit_dir: "/var/lib/modwarden/audit".to_string(),
            control_socket: None,
            toxicity: None,
            feeds: FeedsConfig::default(),
            default_community: Community::default(),
            communities,
            offline_moderators: BTreeMap::new(),
        }
    }
}

impl Default for Community {
    fn default() -> Self {
        Community {
            name: String::new(),
            mirror_board: None,
            removals_board: None,
            removals_chat: None,
            bans_chat: None,
            shadowbans_chat: None,
            comment_mod_permissions: vec![
                "posts".to_string(),
                "mail".to_string(),
                "wiki".to_string(),
            ],
            comment_mod_whitelist: vec!["StatementBot".to_string()],
            features: Features::default(),
            audit_sheet: None,
            flair_violation_marker: "rule".to_string(),
            toxicity_threshold: 0.85,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            write_spacing_secs: 5,
            acknowledge_spacing_secs: 1,
            max_retries: 3,
            backoff_base_secs: 5,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_secs: 30,
            max_restarts: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ignored_actors: vec!["AutoModerator".to_string()],
            audit_excluded_actors: vec!["ModWardenBot".to_string()],
        }
    }
}

impl Default for ModmailConfig {
    fn default() -> Self {
        Self {
            support_bots: vec![
                "reddit".to_string(),
                "ModSupportBot".to_string(),
                "AutoModerator".to_string(),
            ],
            automated_note_actors: vec![
                "AutoModerator".to_string(),
                "reddit".to_string(),
                "Anti-Evil Operations".to_string(),
            ],
            removal_keywords: vec!["remov".to_string(), "delet".to_string()],
            qualifying_note_actions: vec![
                "removecomment".to_string(),
                "removelink".to_string(),
                "banuser".to_string(),
            ],
            note_window_days: 7,
            reply_template: "Hi, thanks for reaching out. Could you please provide a link to \
                the post or comment you are asking about? That lets us look into it quickly."
                .to_string(),
        }
    }
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            dir: "/var/lib/modwarden/feeds".to_string(),
            backlog: 100,
            poll_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn registry(&self) -> CommunityRegistry {
        CommunityRegistry::new(self.default_community.clone(), self.communities.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitored.is_empty() {
            return Err(ConfigError::NothingMonitored);
        }
        if self.dispatch.backoff_base_secs == 0 {
            return Err(ConfigError::InvalidDispatch(
                "backoff_base_secs must be at least 1".to_string(),
            ));
        }

        let registry = self.registry();
        for name in &self.monitored {
            let community = registry.resolve(name);
            let invalid = |message: &str| ConfigError::InvalidCommunity {
                community: name.clone(),
                message: message.to_string(),
            };

            if !(0.0..=1.0).contains(&community.toxicity_threshold) {
                return Err(invalid("toxicity_threshold must be within 0..=1"));
            }
            if community.features.audit && community.audit_sheet.is_none() {
                return Err(invalid("audit is enabled but no audit_sheet is set"));
            }
            if community.flair_violation_marker.trim().is_empty() {
                return Err(invalid("flair_violation_marker must not be empty"));
            }
            if community.comment_mod_permissions.is_empty() {
                return Err(invalid("comment_mod_permissions must not be empty"));
            }
        }
        Ok(())
    }
}

/// Community name to settings, with a default entry for unlisted names.
#[derive(Debug, Clone)]
pub struct CommunityRegistry {
    default: Community,
    entries: BTreeMap<String, Community>,
}

impl CommunityRegistry {
    pub fn new(default: Community, entries: BTreeMap<String, Community>) -> Self {
        Self { default, entries }
    }

    pub fn resolve(&self, name: &str) -> Community {
        let mut community = self
            .entries
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        community.name = name.to_string();
        community
    }

    pub fn is_listed(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        let registry = Config::default().registry();

        let collapse = registry.resolve("collapse");
        assert_eq!(collapse.name, "collapse");
        assert_eq!(collapse.mirror_board.as_deref(), Some("collapse_wilds"));
        assert!(registry.is_listed("collapse"));

        let ufos = registry.resolve("UFOs");
        assert_eq!(ufos.name, "UFOs");
        assert!(ufos.mirror_board.is_none());
        assert_eq!(ufos.comment_mod_permissions, vec!["posts", "mail", "wiki"]);
        assert!(!registry.is_listed("UFOs"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
monitored: [collapse, UFOs]
dry_run: true
communities:
  collapse:
    mirror_board: collapse_wilds
    removals_chat:
      server: Collapse Moderators
      channel: fm-general
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.supervisor.restart_delay_secs, 30);

        let collapse = config.registry().resolve("collapse");
        assert_eq!(
            collapse.removals_chat,
            Some(ChatDestination::new("Collapse Moderators", "fm-general"))
        );
        assert_eq!(collapse.flair_violation_marker, "rule");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_audit_without_sheet() {
        let mut config = Config::default();
        config.communities.get_mut("collapse").unwrap().audit_sheet = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCommunity { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_monitor_list() {
        let config = Config {
            monitored: vec![],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NothingMonitored)));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modwarden.yaml");
        let path = path.to_string_lossy().to_string();
        Config::default().to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();

        assert_eq!(loaded.monitored, vec!["collapse"]);
        assert!(loaded.registry().resolve("collapse").features.audit);
    }
}
