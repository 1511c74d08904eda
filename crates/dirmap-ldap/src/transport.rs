//! Directory wire protocol
//!
//! [`DirectoryTransport`] is the seam between a search session and the
//! server. [`LdapTransport`] speaks LDAPv3 through `ldap3`.

use async_trait::async_trait;
use ldap3::{
    DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope, SearchOptions,
    SearchResult,
};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use dirmap::config::DirectoryConfig;
use dirmap::error::{
    DirectoryError, DirectoryResult, RC_ALREADY_EXISTS, RC_INVALID_CREDENTIALS,
    RC_NO_SUCH_OBJECT, RC_SIZE_LIMIT_EXCEEDED,
};
use dirmap::operation::{
    is_dn_attribute, AttributeSet, DerefPolicy, SearchParams, SearchScope,
};

use crate::config::LdapConfig;
use crate::raw::{RawItem, RawValue};

/// A connection-level option.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOption {
    /// Protocol version to speak.
    ProtocolVersion(u8),
    /// Whether the client chases referrals itself.
    FollowReferrals(bool),
    /// Per-operation timeout (zero waits indefinitely).
    OperationTimeout(Duration),
    /// Default search size limit.
    SizeLimit(i32),
    /// Default search time limit in seconds.
    TimeLimit(i32),
    /// Default alias dereferencing.
    Deref(DerefPolicy),
}

impl SessionOption {
    /// Option name as reported in errors.
    pub fn name(&self) -> &'static str {
        match self {
            SessionOption::ProtocolVersion(_) => "protocol_version",
            SessionOption::FollowReferrals(_) => "follow_referrals",
            SessionOption::OperationTimeout(_) => "operation_timeout",
            SessionOption::SizeLimit(_) => "size_limit",
            SessionOption::TimeLimit(_) => "time_limit",
            SessionOption::Deref(_) => "deref",
        }
    }
}

impl fmt::Display for SessionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOption::ProtocolVersion(v) => write!(f, "protocol_version={v}"),
            SessionOption::FollowReferrals(b) => write!(f, "follow_referrals={b}"),
            SessionOption::OperationTimeout(d) => write!(f, "operation_timeout={}s", d.as_secs()),
            SessionOption::SizeLimit(n) => write!(f, "size_limit={n}"),
            SessionOption::TimeLimit(n) => write!(f, "time_limit={n}"),
            SessionOption::Deref(d) => write!(f, "deref={d:?}"),
        }
    }
}

/// Wire access to a directory server.
///
/// Reads return raw items; normalization and caching are the session's job.
#[async_trait]
pub trait DirectoryTransport: Send {
    /// Endpoint identity used in search cache keys.
    fn endpoint(&self) -> &str;

    /// Apply a connection option.
    fn set_option(&mut self, option: &SessionOption) -> DirectoryResult<()>;

    /// Authenticate. An empty DN binds anonymously.
    async fn bind(&mut self, bind_dn: &str, password: &str) -> DirectoryResult<()>;

    /// Run a search. Hitting the size limit is not an error.
    async fn search(&mut self, params: &SearchParams) -> DirectoryResult<Vec<RawItem>>;

    /// Create an entry.
    async fn add(&mut self, dn: &str, attributes: &AttributeSet) -> DirectoryResult<()>;

    /// Replace the given attributes of an entry.
    async fn modify(&mut self, dn: &str, changes: &AttributeSet) -> DirectoryResult<()>;

    /// Delete an entry.
    async fn delete(&mut self, dn: &str) -> DirectoryResult<()>;

    /// Change an entry's RDN and optionally its parent.
    async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> DirectoryResult<()>;

    /// Close the connection.
    async fn unbind(&mut self) -> DirectoryResult<()>;
}

/// Map a write result code onto the error taxonomy.
pub(crate) fn write_outcome(op: &str, dn: &str, rc: u32, text: &str) -> DirectoryResult<()> {
    match rc {
        0 => Ok(()),
        RC_NO_SUCH_OBJECT => Err(DirectoryError::ObjectNotFound { dn: dn.to_string() }),
        RC_ALREADY_EXISTS => Err(DirectoryError::ObjectAlreadyExists { dn: dn.to_string() }),
        rc => Err(DirectoryError::operation_failed_with_code(
            rc,
            format!("LDAP {op} failed with code {rc}: {text}"),
        )),
    }
}

/// Wire values per attribute, sorted by name, with `dn` left out.
///
/// Fails when a value has no directory form, before anything is sent.
pub(crate) fn wire_attributes(
    attributes: &AttributeSet,
) -> DirectoryResult<Vec<(String, Vec<RawValue>)>> {
    let mut wire = attributes
        .iter()
        .filter(|(name, _)| !is_dn_attribute(name))
        .map(|(name, value)| {
            RawValue::encode(value)
                .map(|values| (name.clone(), values))
                .ok_or_else(|| DirectoryError::InvalidData {
                    message: format!("attribute {name} has no directory form"),
                })
        })
        .collect::<DirectoryResult<Vec<_>>>()?;
    wire.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(wire)
}

fn value_set(values: &[RawValue]) -> HashSet<Vec<u8>> {
    values.iter().map(|value| value.as_bytes().to_vec()).collect()
}

/// Attribute list for an add request. Valueless attributes are left out.
pub(crate) fn add_attributes(
    attributes: &AttributeSet,
) -> DirectoryResult<Vec<(Vec<u8>, HashSet<Vec<u8>>)>> {
    Ok(wire_attributes(attributes)?
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(name, values)| (name.into_bytes(), value_set(&values)))
        .collect())
}

/// Replace modifications for a change set.
///
/// A null value replaces with nothing, which clears the attribute.
pub(crate) fn replace_mods(changes: &AttributeSet) -> DirectoryResult<Vec<Mod<Vec<u8>>>> {
    Ok(wire_attributes(changes)?
        .into_iter()
        .map(|(name, values)| Mod::Replace(name.into_bytes(), value_set(&values)))
        .collect())
}

fn ldap_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

fn ldap_deref(deref: DerefPolicy) -> DerefAliases {
    match deref {
        DerefPolicy::Never => DerefAliases::Never,
        DerefPolicy::Searching => DerefAliases::Searching,
        DerefPolicy::Finding => DerefAliases::Finding,
        DerefPolicy::Always => DerefAliases::Always,
    }
}

/// [`DirectoryTransport`] over an `ldap3` connection.
pub struct LdapTransport {
    ldap: Ldap,
    endpoint: String,
    operation_timeout: Option<Duration>,
}

impl LdapTransport {
    /// Open a connection. Binding is left to the caller.
    #[instrument(skip(config), fields(host = %config.host))]
    pub async fn connect(config: &LdapConfig) -> DirectoryResult<Self> {
        config.validate()?;
        let url = config.url();

        debug!(url = %url, "Connecting to LDAP server");

        let settings = LdapConnSettings::new()
            .set_conn_timeout(config.connection.connection_timeout())
            .set_starttls(config.use_starttls);

        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| {
                DirectoryError::connection_failed_with_source(
                    format!("Failed to connect to LDAP server at {url}"),
                    e,
                )
            })?;

        // Spawn the connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        info!(url = %url, "LDAP connection established");

        Ok(Self {
            ldap,
            endpoint: url,
            operation_timeout: config.connection.operation_timeout(),
        })
    }

    /// Connection handle with the operation timeout armed for the next request.
    fn handle(&mut self) -> &mut Ldap {
        if let Some(timeout) = self.operation_timeout {
            self.ldap.with_timeout(timeout);
        }
        &mut self.ldap
    }

    fn request_error(&self, message: String, e: LdapError) -> DirectoryError {
        match (e, self.operation_timeout) {
            (LdapError::Timeout { .. }, Some(timeout)) => DirectoryError::ConnectionTimeout {
                timeout_secs: timeout.as_secs(),
            },
            (e, _) => DirectoryError::connection_failed_with_source(message, e),
        }
    }
}

impl fmt::Debug for LdapTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapTransport")
            .field("endpoint", &self.endpoint)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

#[async_trait]
impl DirectoryTransport for LdapTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn set_option(&mut self, option: &SessionOption) -> DirectoryResult<()> {
        match option {
            SessionOption::ProtocolVersion(3) => Ok(()),
            SessionOption::ProtocolVersion(v) => Err(DirectoryError::InvalidConfiguration {
                message: format!("protocol version {v} is not supported, only 3"),
            }),
            SessionOption::FollowReferrals(false) => Ok(()),
            SessionOption::FollowReferrals(true) => Err(DirectoryError::InvalidConfiguration {
                message: "client-side referral chasing is not supported".to_string(),
            }),
            SessionOption::OperationTimeout(timeout) => {
                self.operation_timeout = (!timeout.is_zero()).then_some(*timeout);
                Ok(())
            }
            // Carried on each search request
            SessionOption::SizeLimit(_) | SessionOption::TimeLimit(_) | SessionOption::Deref(_) => {
                Ok(())
            }
        }
    }

    #[instrument(skip(self, password))]
    async fn bind(&mut self, bind_dn: &str, password: &str) -> DirectoryResult<()> {
        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let outcome = self.handle().simple_bind(bind_dn, password).await;
        let result =
            outcome.map_err(|e| self.request_error(format!("LDAP bind failed for {bind_dn}"), e))?;

        match result.rc {
            0 => Ok(()),
            RC_INVALID_CREDENTIALS => Err(DirectoryError::AuthenticationFailed {
                bind_dn: bind_dn.to_string(),
            }),
            rc => Err(DirectoryError::connection_failed(format!(
                "LDAP bind failed with code {rc}: {}",
                result.text
            ))),
        }
    }

    #[instrument(skip(self), fields(base_dn = %params.base_dn, filter = %params.filter))]
    async fn search(&mut self, params: &SearchParams) -> DirectoryResult<Vec<RawItem>> {
        let options = SearchOptions::new()
            .sizelimit(params.size_limit)
            .timelimit(params.time_limit)
            .typesonly(params.attrs_only)
            .deref(ldap_deref(params.deref));

        let attrs: Vec<&str> = if params.attributes.is_empty() {
            vec!["*"]
        } else {
            params.attributes.iter().map(String::as_str).collect()
        };

        let outcome = self
            .handle()
            .with_search_options(options)
            .search(&params.base_dn, ldap_scope(params.scope), &params.filter, attrs)
            .await;
        let SearchResult(entries, result) = outcome.map_err(|e| {
            self.request_error(format!("LDAP search under {} failed", params.base_dn), e)
        })?;

        match result.rc {
            0 => {}
            RC_SIZE_LIMIT_EXCEEDED => {
                debug!(returned = entries.len(), "Size limit reached, returning partial results");
            }
            rc => return Err(DirectoryError::search_failed(rc, result.text)),
        }

        debug!(count = entries.len(), "LDAP search returned");
        Ok(entries.into_iter().map(RawItem::from).collect())
    }

    #[instrument(skip(self, attributes))]
    async fn add(&mut self, dn: &str, attributes: &AttributeSet) -> DirectoryResult<()> {
        let attrs = add_attributes(attributes)?;
        if attrs.is_empty() {
            return Err(DirectoryError::InvalidData {
                message: format!("no attributes to add for {dn}"),
            });
        }

        let outcome = self.handle().add(dn, attrs).await;
        let result =
            outcome.map_err(|e| self.request_error(format!("Failed to add entry: {dn}"), e))?;

        write_outcome("add", dn, result.rc, &result.text)
    }

    #[instrument(skip(self, changes))]
    async fn modify(&mut self, dn: &str, changes: &AttributeSet) -> DirectoryResult<()> {
        let mods = replace_mods(changes)?;
        if mods.is_empty() {
            return Ok(());
        }

        let outcome = self.handle().modify(dn, mods).await;
        let result =
            outcome.map_err(|e| self.request_error(format!("Failed to modify entry: {dn}"), e))?;

        write_outcome("modify", dn, result.rc, &result.text)
    }

    #[instrument(skip(self))]
    async fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        let outcome = self.handle().delete(dn).await;
        let result =
            outcome.map_err(|e| self.request_error(format!("Failed to delete entry: {dn}"), e))?;

        write_outcome("delete", dn, result.rc, &result.text)
    }

    #[instrument(skip(self))]
    async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> DirectoryResult<()> {
        let outcome = self
            .handle()
            .modifydn(dn, new_rdn, delete_old_rdn, new_parent)
            .await;
        let result =
            outcome.map_err(|e| self.request_error(format!("Failed to rename entry: {dn}"), e))?;

        write_outcome("modify DN", dn, result.rc, &result.text)
    }

    async fn unbind(&mut self) -> DirectoryResult<()> {
        self.ldap
            .unbind()
            .await
            .map_err(|e| DirectoryError::connection_failed_with_source("LDAP unbind failed", e))
    }
}
