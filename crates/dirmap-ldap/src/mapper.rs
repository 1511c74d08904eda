//! Change-tracking record
//!
//! A [`Mapper`] holds one directory record: its DN, its current field values
//! and a snapshot of those values as last read or written. `update()` sends
//! only the difference between the two.
//!
//! The difference never describes removed fields. Clearing a field locally
//! and calling `update()` leaves the directory value in place; set the field
//! to [`AttributeValue::Null`] to clear it in the directory instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use dirmap::cursor::{Cursor, RecordCursor};
use dirmap::diff::recursive_diff;
use dirmap::error::{DirectoryError, DirectoryResult};
use dirmap::operation::{
    is_dn_attribute, split_dn, AttributeSet, AttributeValue, CanonicalEntry, DerefPolicy, Rdn,
    SearchParams, SearchScope, DN_ATTRIBUTE, MATCH_ALL_FILTER,
};

use crate::session::{SearchSession, SharedSession};

/// Callback run on every record a mapper materializes.
pub type LoadHook = Arc<dyn Fn(&mut Mapper) + Send + Sync>;

/// Query options for [`Mapper::find`], [`Mapper::count`] and [`Mapper::load`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Search scope (subtree by default).
    pub scope: SearchScope,
    /// Attributes to fetch; empty fetches all.
    pub attributes: Vec<String>,
    /// Fetch attribute names only.
    pub attrs_only: bool,
    /// Maximum records to return.
    pub limit: Option<usize>,
    /// Records to skip before the first one returned.
    pub offset: usize,
    /// Server size limit; defaults to `limit + offset` when a limit is set.
    pub size_limit: Option<i32>,
    /// Server time limit in seconds.
    pub time_limit: Option<i32>,
    /// Alias dereferencing.
    pub deref: Option<DerefPolicy>,
}

impl FindOptions {
    /// Options with every default.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_attrs_only(mut self) -> Self {
        self.attrs_only = true;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_size_limit(mut self, limit: i32) -> Self {
        self.size_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_time_limit(mut self, limit: i32) -> Self {
        self.time_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_deref(mut self, deref: DerefPolicy) -> Self {
        self.deref = Some(deref);
        self
    }
}

/// A directory record with change tracking.
#[derive(Clone)]
pub struct Mapper {
    session: SharedSession,
    base_dn: String,
    dn: Option<String>,
    data: AttributeSet,
    snapshot: AttributeSet,
    cursor: RecordCursor<CanonicalEntry>,
    load_hook: Option<LoadHook>,
}

impl Mapper {
    /// Create an empty record whose queries run under `base_dn`.
    ///
    /// An empty `base_dn` falls back to the session's base DN.
    pub fn new(session: SharedSession, base_dn: impl Into<String>) -> Self {
        Self {
            session,
            base_dn: base_dn.into(),
            dn: None,
            data: AttributeSet::new(),
            snapshot: AttributeSet::new(),
            cursor: RecordCursor::new(),
            load_hook: None,
        }
    }

    /// Register a callback run on every materialized record.
    #[must_use]
    pub fn on_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Mapper) + Send + Sync + 'static,
    {
        self.load_hook = Some(Arc::new(hook));
        self
    }

    /// The record's DN.
    pub fn dn(&self) -> Option<&str> {
        self.dn.as_deref()
    }

    /// Give the record an identity, typically before `insert()`.
    pub fn set_dn(&mut self, dn: impl Into<String>) {
        self.dn = Some(dn.into());
    }

    /// Base DN of this mapper's queries.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// The session this record talks through.
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    // Field access

    /// Set a field. Setting `dn` changes the record's identity.
    pub fn set(&mut self, field: &str, value: impl Into<AttributeValue>) {
        let value = value.into();
        if is_dn_attribute(field) {
            match value.as_string() {
                Some(dn) => self.dn = Some(dn.to_string()),
                None => warn!(field = %field, "Ignoring non-string DN"),
            }
            return;
        }
        self.data.set(field, value);
    }

    /// Get a field. Fails for a field the record does not hold.
    pub fn get(&self, field: &str) -> DirectoryResult<&AttributeValue> {
        self.data
            .get(field)
            .ok_or_else(|| DirectoryError::field_not_found(field))
    }

    /// Whether the record holds a field.
    pub fn exists(&self, field: &str) -> bool {
        self.data.has(field)
    }

    /// Drop a field locally. The DN cannot be cleared.
    pub fn clear(&mut self, field: &str) {
        if !is_dn_attribute(field) {
            self.data.remove(field);
        }
    }

    /// Field names.
    pub fn fields(&self) -> Vec<&str> {
        self.data.names().collect()
    }

    /// Fields plus the reserved `dn` key.
    pub fn cast(&self) -> AttributeSet {
        let mut out = self.data.clone();
        if let Some(dn) = &self.dn {
            out.set(DN_ATTRIBUTE, dn.clone());
        }
        out
    }

    /// Overwrite fields the record already holds with values from `source`.
    pub fn copy_from(&mut self, source: &AttributeSet) {
        for (field, value) in source.iter() {
            if self.data.has(field) {
                self.data.set(field.clone(), value.clone());
            }
        }
    }

    /// Write every field into `target`.
    pub fn copy_to(&self, target: &mut AttributeSet) {
        for (field, value) in self.data.iter() {
            target.set(field.clone(), value.clone());
        }
    }

    /// Fields changed since the last sync.
    pub fn get_changes(&self) -> AttributeSet {
        recursive_diff(&self.data, &self.snapshot)
    }

    /// Mark the current fields as synced.
    pub fn clear_changes(&mut self) {
        self.snapshot = self.data.clone();
    }

    /// Whether any field changed since the last sync.
    pub fn is_dirty(&self) -> bool {
        !self.get_changes().is_empty()
    }

    // Queries

    /// Records matching `filter` (every entry when `None`).
    #[instrument(skip(self, options), fields(base_dn = %self.base_dn))]
    pub async fn find(
        &self,
        filter: Option<&str>,
        options: &FindOptions,
        ttl: Duration,
    ) -> Vec<Mapper> {
        let entries = self.fetch(filter, options, ttl).await;
        debug!(count = entries.len(), "Records found");
        entries.into_iter().map(|entry| self.factory(entry)).collect()
    }

    /// Number of records matching `filter`. `limit` and `offset` are ignored.
    #[instrument(skip(self, options), fields(base_dn = %self.base_dn))]
    pub async fn count(&self, filter: Option<&str>, options: &FindOptions, ttl: Duration) -> u64 {
        let mut session = self.session.lock().await;
        let mut params = self.search_params(&session, filter, options);
        params.size_limit = options
            .size_limit
            .unwrap_or(session.search_defaults().size_limit);
        session.search(params);
        let count = session.count(ttl).await;
        session.free();
        count
    }

    // Writes

    /// Create the record in the directory.
    #[instrument(skip(self), fields(dn = ?self.dn))]
    pub async fn insert(&mut self) -> DirectoryResult<()> {
        let dn = self.require_dn()?;
        self.session.lock().await.add(&dn, &self.data).await?;
        self.clear_changes();
        Ok(())
    }

    /// Write changed fields to the directory.
    ///
    /// The snapshot is synced before the write is sent, so a failed write is
    /// not retried by calling `update()` again; re-read the record instead.
    #[instrument(skip(self), fields(dn = ?self.dn))]
    pub async fn update(&mut self) -> DirectoryResult<()> {
        let dn = self.require_dn()?;
        let changes = self.get_changes();
        self.clear_changes();

        if changes.is_empty() {
            debug!("No changes to write");
            return Ok(());
        }
        self.session.lock().await.modify(&dn, &changes).await
    }

    /// Delete this record, or with a filter every matching record.
    ///
    /// Returns how many records were deleted. A filtered erase attempts every
    /// match and fails with [`DirectoryError::EraseIncomplete`] if any delete
    /// failed.
    #[instrument(skip(self), fields(base_dn = %self.base_dn))]
    pub async fn erase(&mut self, filter: Option<&str>) -> DirectoryResult<usize> {
        let Some(filter) = filter else {
            self.erase_current().await?;
            return Ok(1);
        };

        let targets = self
            .find(Some(filter), &FindOptions::default(), Duration::ZERO)
            .await;
        let mut erased = 0;
        let mut failed = Vec::new();
        for mut target in targets {
            let dn = target.dn.clone().unwrap_or_default();
            match target.erase_current().await {
                Ok(()) => erased += 1,
                Err(e) => {
                    warn!(dn = %dn, error = %e, "Erase failed");
                    failed.push(dn);
                }
            }
        }

        if !failed.is_empty() {
            return Err(DirectoryError::EraseIncomplete { erased, failed });
        }
        info!(filter = %filter, erased, "Records erased");
        Ok(erased)
    }

    /// Change the record's RDN, keeping its parent.
    #[instrument(skip(self), fields(dn = ?self.dn))]
    pub async fn rename(&mut self, new_rdn: &Rdn, delete_old_rdn: bool) -> DirectoryResult<()> {
        let dn = self.require_dn()?;
        let (_, parent) = split_dn(&dn);
        let rdn = new_rdn.to_string();

        self.session
            .lock()
            .await
            .rename(&dn, &rdn, None, delete_old_rdn)
            .await?;
        self.dn = Some(new_rdn.under(parent));
        Ok(())
    }

    /// Move the record under `new_parent`, keeping its RDN.
    #[instrument(skip(self), fields(dn = ?self.dn))]
    pub async fn move_to(&mut self, new_parent: &str) -> DirectoryResult<()> {
        let dn = self.require_dn()?;
        let rdn = split_dn(&dn).0.to_string();

        self.session
            .lock()
            .await
            .rename(&dn, &rdn, Some(new_parent), false)
            .await?;
        self.dn = Some(if new_parent.is_empty() {
            rdn
        } else {
            format!("{rdn},{new_parent}")
        });
        Ok(())
    }

    // Cursor

    /// Load matching records and move to the first. Returns how many loaded.
    pub async fn load(
        &mut self,
        filter: Option<&str>,
        options: &FindOptions,
        ttl: Duration,
    ) -> usize {
        let entries = self.fetch(filter, options, ttl).await;
        let first = self.cursor.load(entries).cloned();
        self.hydrate(first);
        self.cursor.loaded()
    }

    /// Move by `offset` records. False when the cursor ran dry.
    pub fn skip(&mut self, offset: isize) -> bool {
        let entry = self.cursor.skip(offset).cloned();
        self.hydrate(entry)
    }

    /// Move to the first loaded record.
    pub fn first(&mut self) -> bool {
        let entry = self.cursor.first().cloned();
        self.hydrate(entry)
    }

    /// Move to the last loaded record.
    pub fn last(&mut self) -> bool {
        let entry = self.cursor.last().cloned();
        self.hydrate(entry)
    }

    /// Move to the next loaded record.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        self.skip(1)
    }

    /// Move to the previous loaded record.
    pub fn prev(&mut self) -> bool {
        self.skip(-1)
    }

    /// Whether the cursor is off the loaded records.
    pub fn dry(&self) -> bool {
        self.cursor.dry()
    }

    /// Number of loaded records.
    pub fn loaded(&self) -> usize {
        self.cursor.loaded()
    }

    /// Drop the identity, the fields and the loaded records.
    pub fn reset(&mut self) {
        self.dn = None;
        self.data = AttributeSet::new();
        self.snapshot = AttributeSet::new();
        self.cursor.reset();
    }

    fn search_params(
        &self,
        session: &SearchSession,
        filter: Option<&str>,
        options: &FindOptions,
    ) -> SearchParams {
        let base_dn = if self.base_dn.is_empty() {
            session.base_dn()
        } else {
            self.base_dn.as_str()
        };
        let mut params = session
            .search_params(base_dn, filter.unwrap_or(MATCH_ALL_FILTER))
            .with_scope(options.scope)
            .with_attributes(options.attributes.iter().cloned())
            .with_attrs_only(options.attrs_only);

        if let Some(limit) = options.size_limit {
            params.size_limit = limit;
        } else if let Some(limit) = options.limit {
            params.size_limit = i32::try_from(limit.saturating_add(options.offset)).unwrap_or(0);
        }
        if let Some(limit) = options.time_limit {
            params.time_limit = limit;
        }
        if let Some(deref) = options.deref {
            params.deref = deref;
        }
        params
    }

    async fn fetch(
        &self,
        filter: Option<&str>,
        options: &FindOptions,
        ttl: Duration,
    ) -> Vec<CanonicalEntry> {
        let entries = {
            let mut session = self.session.lock().await;
            let params = self.search_params(&session, filter, options);
            session.search(params);
            let entries = if options.limit == Some(1) && options.offset == 0 {
                session.get_first_entry(ttl).await.into_iter().collect()
            } else {
                session.get_all(ttl).await
            };
            session.free();
            entries
        };

        entries
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Materialize an entry as a new clean record sharing this one's setup.
    fn factory(&self, entry: CanonicalEntry) -> Mapper {
        let mut mapper = self.clone();
        mapper.reset();
        let current = mapper.cursor.load(vec![entry]).cloned();
        mapper.hydrate(current);
        mapper
    }

    fn hydrate(&mut self, entry: Option<CanonicalEntry>) -> bool {
        match entry {
            Some(entry) => {
                self.dn = Some(entry.dn);
                self.data = entry.attributes;
                self.snapshot = self.data.clone();
                if let Some(hook) = self.load_hook.clone() {
                    hook(self);
                }
                true
            }
            None => {
                self.dn = None;
                self.data = AttributeSet::new();
                self.snapshot = AttributeSet::new();
                false
            }
        }
    }

    async fn erase_current(&mut self) -> DirectoryResult<()> {
        let dn = self.require_dn()?;
        self.session.lock().await.delete(&dn).await?;

        self.cursor.remove_current();
        let next = self.cursor.current().cloned();
        self.hydrate(next);
        Ok(())
    }

    fn require_dn(&self) -> DirectoryResult<String> {
        self.dn.clone().ok_or_else(|| DirectoryError::InvalidData {
            message: "record has no DN".to_string(),
        })
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("base_dn", &self.base_dn)
            .field("dn", &self.dn)
            .field("data", &self.data)
            .field("dirty", &self.is_dirty())
            .field("loaded", &self.cursor.loaded())
            .finish()
    }
}
