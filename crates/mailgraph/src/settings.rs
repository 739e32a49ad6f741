//! Application settings: a JSON file plus environment overrides.

use std::path::{Path, PathBuf};

use mailgraph_auth::ClientConfig;
use serde::Deserialize;

/// Tenant used when none is configured.
pub const DEFAULT_TENANT: &str = "common";

/// Scopes requested when none are configured.
pub const DEFAULT_SCOPES: &[&str] = &[
    "user.read",
    "mail.read",
    "mail.send",
    "calendars.readwrite",
    "offline_access",
];

const ENV_CLIENT_ID: &str = "MAILGRAPH_CLIENT_ID";
const ENV_TENANT_ID: &str = "MAILGRAPH_TENANT_ID";
const ENV_SCOPES: &str = "MAILGRAPH_SCOPES";

/// Settings errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Settings file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Settings file is not valid JSON.
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// No client id in the file or the environment.
    #[error("no client id configured (set clientId in settings.json or {ENV_CLIENT_ID})")]
    MissingClientId,

    /// Values were present but rejected.
    #[error(transparent)]
    Invalid(#[from] mailgraph_auth::Error),
}

/// Contents of `settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Application (client) id of the app registration.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Tenant id, or `common` / `organizations` / `consumers`.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Scopes requested at sign-in.
    #[serde(default)]
    pub graph_user_scopes: Option<Vec<String>>,
}

impl Settings {
    /// Default settings location: `<config dir>/mailgraph/settings.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailgraph")
            .join("settings.json")
    }

    /// Loads settings from `path`, or from [`Settings::default_path`] when
    /// `path` is `None`. A missing default file yields empty settings; a
    /// missing explicit file is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
        let settings =
            serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Applies `MAILGRAPH_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    /// Empty values are ignored.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());

        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            self.client_id = Some(client_id);
        }
        if let Some(tenant_id) = lookup(ENV_TENANT_ID) {
            self.tenant_id = Some(tenant_id);
        }
        if let Some(scopes) = lookup(ENV_SCOPES) {
            self.graph_user_scopes = Some(
                scopes
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        self
    }

    /// Builds the authenticator configuration, filling in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if no client id is set or the values are invalid.
    pub fn client_config(&self) -> Result<ClientConfig, SettingsError> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or(SettingsError::MissingClientId)?;
        let tenant_id = self.tenant_id.as_deref().unwrap_or(DEFAULT_TENANT);

        let config = match &self.graph_user_scopes {
            Some(scopes) => ClientConfig::new(client_id, tenant_id, scopes)?,
            None => ClientConfig::new(client_id, tenant_id, DEFAULT_SCOPES)?,
        };
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_camel_case() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "clientId": "abc",
                "tenantId": "organizations",
                "graphUserScopes": ["user.read", "mail.read"]
            }"#,
        )
        .unwrap();

        assert_eq!(settings.client_id.as_deref(), Some("abc"));
        assert_eq!(settings.tenant_id.as_deref(), Some("organizations"));
        assert_eq!(
            settings.graph_user_scopes,
            Some(vec!["user.read".to_string(), "mail.read".to_string()])
        );
    }

    #[test]
    fn test_defaults_fill_in() {
        let settings = Settings {
            client_id: Some("abc".to_string()),
            ..Settings::default()
        };
        let config = settings.client_config().unwrap();

        assert_eq!(config.tenant_id(), DEFAULT_TENANT);
        assert_eq!(config.scopes(), DEFAULT_SCOPES);
    }

    #[test]
    fn test_missing_client_id() {
        assert!(matches!(
            Settings::default().client_config(),
            Err(SettingsError::MissingClientId)
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let settings = Settings {
            client_id: Some("abc".to_string()),
            graph_user_scopes: Some(vec![]),
            ..Settings::default()
        };
        assert!(matches!(
            settings.client_config(),
            Err(SettingsError::Invalid(mailgraph_auth::Error::Config(_)))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings {
            client_id: Some("from-file".to_string()),
            tenant_id: Some("organizations".to_string()),
            graph_user_scopes: None,
        }
        .with_overrides(env(&[
            ("MAILGRAPH_CLIENT_ID", "from-env"),
            ("MAILGRAPH_TENANT_ID", "  "),
            ("MAILGRAPH_SCOPES", "user.read, mail.send offline_access"),
        ]));

        assert_eq!(settings.client_id.as_deref(), Some("from-env"));
        assert_eq!(settings.tenant_id.as_deref(), Some("organizations"));
        assert_eq!(
            settings.graph_user_scopes,
            Some(vec![
                "user.read".to_string(),
                "mail.send".to_string(),
                "offline_access".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!(
            "mailgraph-settings-{}.json",
            std::process::id()
        ));
        tokio::fs::write(&path, r#"{"clientId": "abc"}"#).await.unwrap();

        let settings = Settings::load(Some(&path)).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(settings.client_id.as_deref(), Some("abc"));
        assert_eq!(settings.tenant_id, None);
    }

    #[tokio::test]
    async fn test_load_missing_explicit_file_fails() {
        let path = std::env::temp_dir().join("mailgraph-settings-does-not-exist.json");
        assert!(matches!(
            Settings::load(Some(&path)).await,
            Err(SettingsError::Read { .. })
        ));
    }
}
