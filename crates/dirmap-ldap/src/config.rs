//! LDAP configuration
//!
//! Connection, credential, cache and search-default settings for a session.

use serde::{Deserialize, Serialize};

use dirmap::config::{CacheSettings, ConnectionSettings, DirectoryConfig};
use dirmap::error::{DirectoryError, DirectoryResult};
use dirmap::operation::DerefPolicy;

/// Search limits applied when a query does not set its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchDefaults {
    /// Maximum entries per search (0 = server limit).
    #[serde(default)]
    pub size_limit: i32,

    /// Maximum seconds per search (0 = server limit).
    #[serde(default)]
    pub time_limit: i32,

    /// Alias dereferencing policy.
    #[serde(default)]
    pub deref: DerefPolicy,
}

/// Configuration for an LDAP search session.
#[derive(Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// LDAP server hostname or IP address.
    pub host: String,

    /// LDAP server port (389 for LDAP, 636 for LDAPS).
    #[serde(default = "default_ldap_port")]
    pub port: u16,

    /// Use SSL/TLS (LDAPS).
    #[serde(default)]
    pub use_ssl: bool,

    /// Use STARTTLS upgrade on plain LDAP connection.
    #[serde(default)]
    pub use_starttls: bool,

    /// Base DN for record lookups (e.g., "dc=example,dc=com").
    pub base_dn: String,

    /// Bind DN used when no explicit user is given. Empty binds anonymously.
    #[serde(default)]
    pub bind_dn: String,

    /// Bind password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Connection settings (timeouts).
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Default search limits.
    #[serde(default)]
    pub search: SearchDefaults,
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("use_starttls", &self.use_starttls)
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .field("search", &self.search)
            .finish()
    }
}

fn default_ldap_port() -> u16 {
    389
}

impl LdapConfig {
    /// Create a new LDAP config with required fields.
    pub fn new(
        host: impl Into<String>,
        base_dn: impl Into<String>,
        bind_dn: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_ldap_port(),
            use_ssl: false,
            use_starttls: false,
            base_dn: base_dn.into(),
            bind_dn: bind_dn.into(),
            bind_password: None,
            connection: ConnectionSettings::default(),
            cache: CacheSettings::default(),
            search: SearchDefaults::default(),
        }
    }

    /// Set bind password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.bind_password = Some(password.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable SSL (LDAPS).
    #[must_use]
    pub fn with_ssl(mut self) -> Self {
        self.use_ssl = true;
        self.port = 636;
        self
    }

    /// Enable STARTTLS.
    #[must_use]
    pub fn with_starttls(mut self) -> Self {
        self.use_starttls = true;
        self
    }

    /// Set cache settings.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    /// Set default search limits.
    #[must_use]
    pub fn with_search_defaults(mut self, search: SearchDefaults) -> Self {
        self.search = search;
        self
    }

    /// Get the LDAP URL.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "ldaps" } else { "ldap" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl DirectoryConfig for LdapConfig {
    fn validate(&self) -> DirectoryResult<()> {
        if self.host.is_empty() {
            return Err(DirectoryError::InvalidConfiguration {
                message: "host is required".to_string(),
            });
        }

        if self.host.contains("://") || self.host.contains('/') {
            return Err(DirectoryError::InvalidConfiguration {
                message: format!("host must be a bare hostname, got '{}'", self.host),
            });
        }

        if self.base_dn.is_empty() {
            return Err(DirectoryError::InvalidConfiguration {
                message: "base_dn is required".to_string(),
            });
        }

        if self.use_ssl && self.use_starttls {
            return Err(DirectoryError::InvalidConfiguration {
                message: "cannot use both SSL and STARTTLS".to_string(),
            });
        }

        Ok(())
    }

    fn get_credentials(&self) -> Vec<(&'static str, String)> {
        match &self.bind_password {
            Some(password) => vec![("bind_password", password.clone())],
            None => vec![],
        }
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.bind_password.is_some() {
            config.bind_password = Some("***REDACTED***".to_string());
        }
        config
    }
}
