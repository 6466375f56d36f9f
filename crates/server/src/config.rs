//! Server configuration (YAML).

use crate::error::{Result, ServerError};
use routebridge_openapi_tools::config::{ConversionOptions, FilterRules};
use routebridge_openapi_tools::filter::validate_rules;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MOUNT_PATH: &str = "/mcp";
pub const DEFAULT_SCOPE: &str = "openid profile email";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    /// Path or `http(s)` URL of the `OpenAPI` document.
    #[serde(default)]
    pub spec: Option<String>,
    /// Target of tool invocations. Defaults to the document's first server URL.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(flatten)]
    pub conversion: ConversionOptions,
    #[serde(flatten)]
    pub filters: FilterRules,

    #[serde(default = "default_true")]
    pub auto_generate_prompts: bool,
    #[serde(default)]
    pub prompts: Vec<PromptConfig>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    /// Caller headers forwarded to the invoked API.
    #[serde(default = "default_forward_headers")]
    pub forward_headers: Vec<String>,

    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: None,
            spec: None,
            base_url: None,
            conversion: ConversionOptions::default(),
            filters: FilterRules::default(),
            auto_generate_prompts: true,
            prompts: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            mount_path: default_mount_path(),
            forward_headers: default_forward_headers(),
            auth: None,
        }
    }
}

impl ServerConfig {
    /// Read and validate a YAML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or fails validation.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Construction-time checks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Configuration`] for contradictory filters, a bad mount path, a
    /// zero timeout or incomplete auth settings.
    pub fn validate(&self) -> Result<()> {
        validate_rules(&self.filters)?;
        self.conversion.validate()?;
        if !self.mount_path.starts_with('/') || self.mount_path.len() < 2 {
            return Err(ServerError::Configuration(format!(
                "mount_path must start with '/' and not be the root: '{}'",
                self.mount_path
            )));
        }
        if self.mount_path.ends_with('/') {
            return Err(ServerError::Configuration(format!(
                "mount_path must not end with '/': '{}'",
                self.mount_path
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ServerError::Configuration(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        for prompt in &self.prompts {
            if prompt.name.trim().is_empty() {
                return Err(ServerError::Configuration(
                    "prompt names must not be empty".to_string(),
                ));
            }
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        Ok(())
    }
}

/// An explicitly registered prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptConfig {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgumentConfig>,
    /// `minijinja` template; arguments are template variables.
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptArgumentConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// OAuth compatibility proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    /// Upstream discovery document, fetched once at startup.
    #[serde(default)]
    pub oauth_metadata_url: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_scope")]
    pub default_scope: String,
    /// Served verbatim as the discovery document when set.
    #[serde(default)]
    pub custom_oauth_metadata: Option<Value>,
    /// Serve the discovery document and the authorize/token/register proxies.
    #[serde(default)]
    pub setup_proxies: bool,
    #[serde(default)]
    pub setup_fake_dynamic_registration: bool,
    #[serde(default)]
    pub guard_checks: Vec<GuardCheckConfig>,
    /// Externally visible base URL of this server. Derived from the `Host` header when unset.
    #[serde(default)]
    pub public_url: Option<String>,

    #[serde(default = "default_metadata_path")]
    pub metadata_path: String,
    #[serde(default = "default_authorize_path")]
    pub authorize_path: String,
    #[serde(default = "default_token_path")]
    pub token_path: String,
    #[serde(default = "default_register_path")]
    pub register_path: String,
    /// When set, the authorize proxy sends the provider back here instead of to the client,
    /// and this route exchanges the code and redirects to the client with the token.
    #[serde(default)]
    pub callback_path: Option<String>,
    /// Fetched with the new access token on callback; also advertised as `userinfo_endpoint`.
    #[serde(default)]
    pub user_info_url: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            authorize_url: None,
            token_url: None,
            oauth_metadata_url: None,
            audience: None,
            client_id: None,
            client_secret: None,
            default_scope: default_scope(),
            custom_oauth_metadata: None,
            setup_proxies: false,
            setup_fake_dynamic_registration: false,
            guard_checks: Vec::new(),
            public_url: None,
            metadata_path: default_metadata_path(),
            authorize_path: default_authorize_path(),
            token_path: default_token_path(),
            register_path: default_register_path(),
            callback_path: None,
            user_info_url: None,
        }
    }
}

impl AuthConfig {
    /// Whether the discovery and protected-resource documents are served.
    #[must_use]
    pub fn serves_metadata(&self) -> bool {
        self.setup_proxies || self.custom_oauth_metadata.is_some()
    }

    /// # Errors
    ///
    /// Returns [`ServerError::Configuration`] naming the first missing or invalid field.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            ServerError::Configuration(format!("auth.{field} is required"))
        };

        if let Some(custom) = &self.custom_oauth_metadata
            && !custom.is_object()
        {
            return Err(ServerError::Configuration(
                "auth.custom_oauth_metadata must be an object".to_string(),
            ));
        }

        if self.issuer.is_none()
            && self.custom_oauth_metadata.is_none()
            && self.guard_checks.is_empty()
        {
            return Err(ServerError::Configuration(
                "auth needs at least one of 'issuer', 'custom_oauth_metadata' or 'guard_checks'"
                    .to_string(),
            ));
        }

        if self.setup_proxies && self.client_id.is_none() {
            return Err(ServerError::Configuration(
                "auth.client_id is required when setup_proxies is enabled".to_string(),
            ));
        }

        // A synthesized discovery document names the upstream endpoints itself. Custom or
        // fetched metadata may carry them instead; the proxy checks that once the document is
        // known.
        let synthesized = self.custom_oauth_metadata.is_none() && self.oauth_metadata_url.is_none();
        if synthesized && (self.setup_proxies || self.setup_fake_dynamic_registration) {
            if self.issuer.is_none() {
                return Err(missing("issuer"));
            }
            if self.authorize_url.is_none() {
                return Err(missing("authorize_url"));
            }
            if self.token_url.is_none() {
                return Err(missing("token_url"));
            }
        }

        if self.callback_path.is_some() {
            if !self.setup_proxies {
                return Err(ServerError::Configuration(
                    "auth.callback_path requires setup_proxies".to_string(),
                ));
            }
            if self.client_secret.is_none() {
                return Err(ServerError::Configuration(
                    "auth.client_secret is required when callback_path is set".to_string(),
                ));
            }
        }

        if self.setup_fake_dynamic_registration {
            if self.client_id.is_none() {
                return Err(ServerError::Configuration(
                    "auth.client_id is required when setup_fake_dynamic_registration is enabled"
                        .to_string(),
                ));
            }
            if self.client_secret.is_none() {
                return Err(ServerError::Configuration(
                    "auth.client_secret is required when setup_fake_dynamic_registration is enabled"
                        .to_string(),
                ));
            }
        }

        for path in [
            &self.metadata_path,
            &self.authorize_path,
            &self.token_path,
            &self.register_path,
        ]
        .into_iter()
        .chain(&self.callback_path)
        {
            if !path.starts_with('/') {
                return Err(ServerError::Configuration(format!(
                    "auth route '{path}' must start with '/'"
                )));
            }
        }

        for check in &self.guard_checks {
            check.validate()?;
        }
        Ok(())
    }
}

/// One guard check, run in order before any tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardCheckConfig {
    /// A non-empty bearer token must be present.
    Bearer,
    /// A header must carry one of the configured keys.
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        values: Vec<String>,
    },
    /// An RS256 JWT validated against the issuer's JWKS.
    Jwt {
        issuer: String,
        #[serde(default)]
        audiences: Vec<String>,
        /// Skips discovery when set.
        #[serde(default)]
        jwks_uri: Option<String>,
        #[serde(default = "default_leeway_secs")]
        leeway_secs: u64,
    },
}

impl GuardCheckConfig {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Bearer => Ok(()),
            Self::ApiKey { header, values } => {
                if header.trim().is_empty() {
                    return Err(ServerError::Configuration(
                        "api_key guard check needs a header name".to_string(),
                    ));
                }
                if values.is_empty() {
                    return Err(ServerError::Configuration(
                        "api_key guard check needs at least one value".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Jwt { issuer, .. } => {
                if issuer.trim().is_empty() {
                    return Err(ServerError::Configuration(
                        "jwt guard check needs an issuer".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn default_name() -> String {
    "routebridge".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_mount_path() -> String {
    DEFAULT_MOUNT_PATH.to_string()
}

fn default_forward_headers() -> Vec<String> {
    vec!["authorization".to_string()]
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_metadata_path() -> String {
    "/.well-known/oauth-authorization-server".to_string()
}

fn default_authorize_path() -> String {
    "/oauth/authorize".to_string()
}

fn default_token_path() -> String {
    "/oauth/token".to_string()
}

fn default_register_path() -> String {
    "/oauth/register".to_string()
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_leeway_secs() -> u64 {
    60
}
