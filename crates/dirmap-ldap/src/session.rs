//! Search session
//!
//! A [`SearchSession`] owns one directory connection, the query it is
//! currently working on, and a cursor over that query's entries.
//!
//! ```text
//! Idle --search()--> ResultPending --first()--> Positioned --next()--> Positioned | Exhausted
//!   ^                                                                                  |
//!   +------------------------------------free()-------------------------------------------+
//! ```
//!
//! `search()` only records the query. It is sent to the directory by the
//! first operation that needs entries and cannot be answered from the cache.
//! A failed dispatch drops the session back to Idle; read operations then
//! return empty results and [`SearchSession::last_error`] holds the detail.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use dirmap::cache::{CacheKey, CachedValue, ResultCache};
use dirmap::error::{DirectoryError, DirectoryResult};
use dirmap::ids::SessionId;
use dirmap::operation::{
    AttributeSet, CanonicalEntry, SearchParams, SearchScope, MATCH_ALL_FILTER,
};

use crate::config::{LdapConfig, SearchDefaults};
use crate::normalize::normalize_all;
use crate::transport::{DirectoryTransport, LdapTransport, SessionOption};

/// A session shared between records.
pub type SharedSession = Arc<Mutex<SearchSession>>;

/// Where a session is in its query lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No query.
    Idle,
    /// A query is recorded but the cursor is not on an entry yet.
    ResultPending,
    /// The cursor is on an entry.
    Positioned,
    /// The cursor moved past the last entry.
    Exhausted,
}

/// The most recent directory failure seen by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// Directory result code, when the failure carried one.
    pub code: Option<u32>,
    /// Human-readable message.
    pub message: String,
}

impl From<&DirectoryError> for LastError {
    fn from(e: &DirectoryError) -> Self {
        Self {
            code: e.result_code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Unset,
    At(usize),
    Exhausted,
}

#[derive(Debug)]
struct PendingSearch {
    params: SearchParams,
    entries: Option<Vec<CanonicalEntry>>,
    position: Position,
    attribute_names: Vec<String>,
    attribute_ptr: Option<usize>,
}

impl PendingSearch {
    fn new(params: SearchParams) -> Self {
        Self {
            params,
            entries: None,
            position: Position::Unset,
            attribute_names: Vec::new(),
            attribute_ptr: None,
        }
    }
}

enum Invalidation<'a> {
    Record(&'a str),
    All,
}

/// A connection plus the state of its current query.
pub struct SearchSession {
    id: SessionId,
    transport: Box<dyn DirectoryTransport>,
    cache: ResultCache,
    base_dn: String,
    defaults: SearchDefaults,
    default_credentials: Option<(String, String)>,
    auth_user: Option<String>,
    pending: Option<PendingSearch>,
    last_error: Option<LastError>,
}

impl SearchSession {
    /// Create a session over an already-open transport.
    pub fn new(transport: impl DirectoryTransport + 'static, cache: ResultCache) -> Self {
        Self {
            id: SessionId::new(),
            transport: Box::new(transport),
            cache,
            base_dn: String::new(),
            defaults: SearchDefaults::default(),
            default_credentials: None,
            auth_user: None,
            pending: None,
            last_error: None,
        }
    }

    /// Connect, apply the default options and bind with the configured credentials.
    #[instrument(skip(config, cache), fields(host = %config.host))]
    pub async fn connect(config: &LdapConfig, cache: ResultCache) -> DirectoryResult<Self> {
        let transport = LdapTransport::connect(config).await?;
        let mut session = Self::new(transport, cache).configured(config);

        session.apply_options(&[
            SessionOption::ProtocolVersion(3),
            SessionOption::FollowReferrals(false),
        ])?;
        session.bind("", "").await?;

        Ok(session)
    }

    /// Take the base DN, search defaults and default credentials from `config`.
    #[must_use]
    pub fn configured(self, config: &LdapConfig) -> Self {
        self.with_base_dn(config.base_dn.clone())
            .with_search_defaults(config.search.clone())
            .with_default_credentials(
                config.bind_dn.clone(),
                config.bind_password.clone().unwrap_or_default(),
            )
    }

    /// Base DN used by records that do not name their own.
    #[must_use]
    pub fn with_base_dn(mut self, base_dn: impl Into<String>) -> Self {
        self.base_dn = base_dn.into();
        self
    }

    /// Credentials used when `bind` is called without a user.
    pub fn with_default_credentials(
        mut self,
        bind_dn: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.default_credentials = Some((bind_dn.into(), password.into()));
        self
    }

    /// Search limits applied to queries built by this session.
    #[must_use]
    pub fn with_search_defaults(mut self, defaults: SearchDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Wrap for sharing between records.
    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Session identifier, for logs.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Endpoint identity of the underlying connection.
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// The result cache in front of this session.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Default base DN, empty when none was configured.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Current search defaults.
    pub fn search_defaults(&self) -> &SearchDefaults {
        &self.defaults
    }

    /// DN of the last successful bind, if it was not anonymous.
    pub fn auth_user(&self) -> Option<&str> {
        self.auth_user.as_deref()
    }

    /// The last failure, cleared by the next successful directory call.
    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match &self.pending {
            None => SessionState::Idle,
            Some(pending) => match pending.position {
                Position::Unset => SessionState::ResultPending,
                Position::At(_) => SessionState::Positioned,
                Position::Exhausted => SessionState::Exhausted,
            },
        }
    }

    /// Apply every option, collecting the ones that fail.
    pub fn apply_options(&mut self, options: &[SessionOption]) -> DirectoryResult<()> {
        let mut failures = Vec::new();

        for option in options {
            if let Err(e) = self.transport.set_option(option) {
                warn!(
                    session_id = %self.id,
                    option = %option,
                    error = %e,
                    "Session option rejected"
                );
                failures.push((option.name().to_string(), e.to_string()));
                continue;
            }
            match option {
                SessionOption::SizeLimit(limit) => self.defaults.size_limit = *limit,
                SessionOption::TimeLimit(limit) => self.defaults.time_limit = *limit,
                SessionOption::Deref(policy) => self.defaults.deref = *policy,
                _ => {}
            }
            debug!(session_id = %self.id, option = %option, "Session option applied");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let err = DirectoryError::OptionsRejected { failures };
            self.last_error = Some(LastError::from(&err));
            Err(err)
        }
    }

    /// Bind as `user`, or with the default credentials when `user` is empty.
    #[instrument(skip(self, password), fields(session_id = %self.id))]
    pub async fn bind(&mut self, user: &str, password: &str) -> DirectoryResult<()> {
        let (bind_dn, password) = match (&self.default_credentials, user.is_empty()) {
            (Some((dn, pw)), true) => (dn.clone(), pw.clone()),
            _ => (user.to_string(), password.to_string()),
        };

        match self.transport.bind(&bind_dn, &password).await {
            Ok(()) => {
                info!(bind_dn = %bind_dn, "Bound to directory");
                self.auth_user = (!bind_dn.is_empty()).then_some(bind_dn);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!(bind_dn = %bind_dn, error = %e, "Bind failed");
                self.auth_user = None;
                self.last_error = Some(LastError::from(&e));
                Err(e)
            }
        }
    }

    /// Close the connection and drop any pending query.
    pub async fn unbind(&mut self) -> DirectoryResult<()> {
        self.pending = None;
        self.auth_user = None;
        self.transport.unbind().await
    }

    /// Parameters for a subtree search, seeded with this session's defaults.
    pub fn search_params(
        &self,
        base_dn: impl Into<String>,
        filter: impl Into<String>,
    ) -> SearchParams {
        SearchParams::new(base_dn, filter)
            .with_size_limit(self.defaults.size_limit)
            .with_time_limit(self.defaults.time_limit)
            .with_deref(self.defaults.deref)
    }

    /// Start a new query, releasing the previous one.
    pub fn search(&mut self, params: SearchParams) -> SessionState {
        debug!(
            session_id = %self.id,
            base_dn = %params.base_dn,
            filter = %params.filter,
            scope = %params.scope,
            "Search recorded"
        );
        self.pending = Some(PendingSearch::new(params));
        self.state()
    }

    /// Start a query for exactly the entry at `dn`.
    pub fn read(
        &mut self,
        dn: &str,
        filter: impl Into<String>,
        attributes: &[&str],
    ) -> SessionState {
        let params = self
            .search_params(dn, filter)
            .with_scope(SearchScope::Base)
            .with_attributes(attributes.iter().copied());
        self.search(params)
    }

    /// Start a query for the immediate children of `base_dn`.
    pub fn list(
        &mut self,
        base_dn: &str,
        filter: impl Into<String>,
        attributes: &[&str],
    ) -> SessionState {
        let params = self
            .search_params(base_dn, filter)
            .with_scope(SearchScope::OneLevel)
            .with_attributes(attributes.iter().copied());
        self.search(params)
    }

    /// Release the pending query.
    pub fn free(&mut self) {
        if self.pending.take().is_some() {
            debug!(session_id = %self.id, "Search freed");
        }
    }

    /// Number of entries the pending query matches. Zero when idle or on failure.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn count(&mut self, ttl: Duration) -> u64 {
        let Some(params) = self.pending_params() else {
            return 0;
        };
        let key = CacheKey::count(self.transport.endpoint(), &params);
        if let Some(count) = self.cache.get_count(&key).await {
            return count;
        }

        if !self.dispatch().await {
            return 0;
        }
        let count = self.loaded().len() as u64;
        self.cache.set(&key, CachedValue::Count(count), ttl).await;
        count
    }

    /// Every entry the pending query matches. Empty when idle or on failure.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn get_all(&mut self, ttl: Duration) -> Vec<CanonicalEntry> {
        let Some(params) = self.pending_params() else {
            return Vec::new();
        };
        let key = CacheKey::search(self.transport.endpoint(), &params);
        if let Some(entries) = self.cache.get_entries(&key).await {
            if let Some(pending) = self.pending.as_mut() {
                pending.entries.get_or_insert_with(|| entries.clone());
            }
            return entries;
        }

        if !self.dispatch().await {
            return Vec::new();
        }
        let entries = self.loaded().to_vec();
        self.cache
            .set(&key, CachedValue::Entries(entries.clone()), ttl)
            .await;
        entries
    }

    /// The first entry of the pending query, positioning the cursor on it.
    ///
    /// A whole-entry read of a single DN is answered from the record-scoped
    /// cache key when possible.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn get_first_entry(&mut self, ttl: Duration) -> Option<CanonicalEntry> {
        let params = self.pending_params()?;
        if params.scope == SearchScope::Base
            && params.filter == MATCH_ALL_FILTER
            && is_whole_entry(&params)
        {
            let key = CacheKey::record(&params.base_dn);
            if let Some(entry) = self.cache.get_entry(&key).await {
                return Some(entry);
            }
        }

        let entry = self.first().await?.clone();
        if is_whole_entry(&params) {
            let key = CacheKey::record(&entry.dn);
            self.cache
                .set(&key, CachedValue::Entry(entry.clone()), ttl)
                .await;
        }
        Some(entry)
    }

    /// Fetch one entry by DN. Replaces any pending query.
    pub async fn get_entry(&mut self, dn: &str, ttl: Duration) -> Option<CanonicalEntry> {
        self.read(dn, MATCH_ALL_FILTER, &[]);
        let entry = self.get_first_entry(ttl).await;
        self.free();
        entry
    }

    /// Move the cursor to the first entry.
    pub async fn first(&mut self) -> Option<&CanonicalEntry> {
        if !self.dispatch().await {
            return None;
        }
        self.move_to(0)
    }

    /// Move the cursor to the next entry. Before any `first`, this is `first`.
    pub async fn next(&mut self) -> Option<&CanonicalEntry> {
        let target = match self.pending.as_ref()?.position {
            Position::Unset => 0,
            Position::At(idx) => idx + 1,
            Position::Exhausted => return None,
        };
        if !self.dispatch().await {
            return None;
        }
        self.move_to(target)
    }

    /// The entry under the cursor.
    pub fn current_entry(&self) -> Option<&CanonicalEntry> {
        let pending = self.pending.as_ref()?;
        match pending.position {
            Position::At(idx) => pending.entries.as_ref()?.get(idx),
            _ => None,
        }
    }

    /// DN of the entry under the cursor.
    pub fn current_dn(&self) -> Option<&str> {
        self.current_entry().map(|entry| entry.dn.as_str())
    }

    /// First attribute name of the entry under the cursor.
    ///
    /// Names are visited in sorted order.
    pub fn first_attribute(&mut self) -> Option<&str> {
        let pending = self.pending.as_mut()?;
        if !matches!(pending.position, Position::At(_)) {
            return None;
        }
        pending.attribute_ptr = Some(0);
        pending.attribute_names.first().map(String::as_str)
    }

    /// Next attribute name of the entry under the cursor.
    pub fn next_attribute(&mut self) -> Option<&str> {
        let pending = self.pending.as_mut()?;
        if !matches!(pending.position, Position::At(_)) {
            return None;
        }
        let next = pending.attribute_ptr.map_or(0, |ptr| ptr + 1);
        pending.attribute_ptr = Some(next);
        pending.attribute_names.get(next).map(String::as_str)
    }

    /// Create an entry. Flushes the whole cache.
    #[instrument(skip(self, attributes), fields(session_id = %self.id))]
    pub async fn add(&mut self, dn: &str, attributes: &AttributeSet) -> DirectoryResult<()> {
        let outcome = self.transport.add(dn, attributes).await;
        self.after_write(&outcome, Invalidation::All).await;
        outcome?;
        info!(dn = %dn, "Directory entry added");
        Ok(())
    }

    /// Replace attributes of one entry. Drops that entry's cached copy only.
    #[instrument(skip(self, changes), fields(session_id = %self.id))]
    pub async fn modify(&mut self, dn: &str, changes: &AttributeSet) -> DirectoryResult<()> {
        let outcome = self.transport.modify(dn, changes).await;
        self.after_write(&outcome, Invalidation::Record(dn)).await;
        outcome?;
        info!(dn = %dn, changed = changes.len(), "Directory entry modified");
        Ok(())
    }

    /// Delete an entry. Flushes the whole cache.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        let outcome = self.transport.delete(dn).await;
        self.after_write(&outcome, Invalidation::All).await;
        outcome?;
        info!(dn = %dn, "Directory entry deleted");
        Ok(())
    }

    /// Rename or move an entry. Flushes the whole cache.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> DirectoryResult<()> {
        let outcome = self
            .transport
            .rename(dn, new_rdn, new_parent, delete_old_rdn)
            .await;
        self.after_write(&outcome, Invalidation::All).await;
        outcome?;
        info!(
            dn = %dn,
            new_rdn = %new_rdn,
            new_parent = ?new_parent,
            "Directory entry renamed"
        );
        Ok(())
    }

    fn pending_params(&self) -> Option<SearchParams> {
        self.pending.as_ref().map(|pending| pending.params.clone())
    }

    fn loaded(&self) -> &[CanonicalEntry] {
        self.pending
            .as_ref()
            .and_then(|pending| pending.entries.as_deref())
            .unwrap_or_default()
    }

    /// Make sure the pending query has entries. False when idle or on failure.
    async fn dispatch(&mut self) -> bool {
        let params = match &self.pending {
            None => return false,
            Some(pending) if pending.entries.is_some() => return true,
            Some(pending) => pending.params.clone(),
        };

        match self.transport.search(&params).await {
            Ok(items) => {
                let entries = normalize_all(&items);
                debug!(
                    session_id = %self.id,
                    base_dn = %params.base_dn,
                    count = entries.len(),
                    "Search dispatched"
                );
                self.last_error = None;
                if let Some(pending) = self.pending.as_mut() {
                    pending.entries = Some(entries);
                }
                true
            }
            Err(e) => {
                warn!(
                    session_id = %self.id,
                    base_dn = %params.base_dn,
                    filter = %params.filter,
                    error = %e,
                    "Search failed, session returned to idle"
                );
                self.last_error = Some(LastError::from(&e));
                self.pending = None;
                false
            }
        }
    }

    fn move_to(&mut self, idx: usize) -> Option<&CanonicalEntry> {
        let pending = self.pending.as_mut()?;
        let entries = pending.entries.as_deref().unwrap_or_default();
        pending.attribute_ptr = None;

        match entries.get(idx) {
            Some(entry) => {
                let mut names: Vec<String> =
                    entry.attributes.names().map(str::to_string).collect();
                names.sort();
                pending.attribute_names = names;
                pending.position = Position::At(idx);
                Some(entry)
            }
            None => {
                pending.attribute_names.clear();
                pending.position = Position::Exhausted;
                None
            }
        }
    }

    async fn after_write(&mut self, outcome: &DirectoryResult<()>, scope: Invalidation<'_>) {
        let applied = match outcome {
            Ok(()) => {
                self.last_error = None;
                true
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Directory write failed");
                self.last_error = Some(LastError::from(e));
                // A lost response may still have been applied
                e.is_transient()
            }
        };
        if !applied {
            return;
        }

        match scope {
            Invalidation::Record(dn) => self.cache.invalidate(&CacheKey::record(dn)).await,
            Invalidation::All => self.cache.invalidate_all().await,
        }
    }
}

fn is_whole_entry(params: &SearchParams) -> bool {
    params.attributes.is_empty() && !params.attrs_only
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("id", &self.id)
            .field("endpoint", &self.transport.endpoint())
            .field("state", &self.state())
            .field("auth_user", &self.auth_user)
            .field("cache", &self.cache)
            .finish()
    }
}
