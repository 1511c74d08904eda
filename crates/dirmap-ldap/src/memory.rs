//! In-memory directory
//!
//! [`MemoryTransport`] keeps entries in process and answers searches with a
//! small RFC 4515 filter evaluator. Clones share state, so a test can hand
//! one clone to a session and inspect the other.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use dirmap::error::{
    DirectoryError, DirectoryResult, RC_ALREADY_EXISTS, RC_INVALID_CREDENTIALS,
    RC_NO_SUCH_OBJECT,
};
use dirmap::operation::{split_dn, AttributeSet, SearchParams, SearchScope};

use crate::raw::{RawEntry, RawItem, RawValue};
use crate::transport::{wire_attributes, write_outcome, DirectoryTransport, SessionOption};

/// LDAP result code for `filterError`.
const RC_FILTER_ERROR: u32 = 87;

/// LDAP result code for `notAllowedOnNonLeaf`.
const RC_NOT_ALLOWED_ON_NON_LEAF: u32 = 66;

/// A write the directory accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    /// Operation name: `add`, `modify`, `delete` or `rename`.
    pub op: &'static str,
    /// Target DN.
    pub dn: String,
    /// Attributes sent with the write.
    pub attributes: AttributeSet,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    dn: String,
    attributes: Vec<(String, Vec<RawValue>)>,
}

impl StoredEntry {
    fn key(&self) -> String {
        dn_key(&self.dn)
    }

    fn values(&self, name: &str) -> Option<&Vec<RawValue>> {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Whether a text value of `name` satisfies `pred`. Binary values never match.
    fn any_value(&self, name: &str, pred: impl Fn(&str) -> bool) -> bool {
        self.values(name)
            .is_some_and(|values| values.iter().filter_map(RawValue::as_text).any(pred))
    }

    fn set(&mut self, name: &str, values: Vec<RawValue>) {
        match self
            .attributes
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = values,
            None => self.attributes.push((name.to_string(), values)),
        }
    }

    fn remove(&mut self, name: &str) {
        self.attributes.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn project(&self, requested: &[String], attrs_only: bool) -> RawEntry {
        let all = requested.is_empty() || requested.iter().any(|r| r == "*");
        let mut raw = RawEntry::new(self.dn.clone());
        for (name, values) in &self.attributes {
            if !all && !requested.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                continue;
            }
            let values = if attrs_only {
                Vec::new()
            } else {
                values.clone()
            };
            raw.push_attribute(name.clone(), values);
        }
        raw
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<StoredEntry>,
    credentials: HashMap<String, String>,
    searches: usize,
    writes: Vec<RecordedWrite>,
    options: Vec<SessionOption>,
    fail_next: Option<(u32, String)>,
    bound_as: Option<String>,
}

impl MemoryState {
    fn position(&self, dn: &str) -> Option<usize> {
        let key = dn_key(dn);
        self.entries.iter().position(|e| e.key() == key)
    }

    fn has_children(&self, dn: &str) -> bool {
        let suffix = format!(",{}", dn_key(dn));
        self.entries.iter().any(|e| e.key().ends_with(&suffix))
    }
}

/// A directory held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    endpoint: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Create an empty directory identified by `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Seed an entry using builder pattern.
    pub fn with_entry(self, dn: &str, attributes: &[(&str, &[&str])]) -> Self {
        self.insert_entry(dn, attributes);
        self
    }

    /// Require `password` when binding as `dn`.
    ///
    /// With no credentials registered every bind succeeds.
    pub fn with_credentials(self, dn: &str, password: &str) -> Self {
        self.state()
            .credentials
            .insert(dn_key(dn), password.to_string());
        self
    }

    /// Seed or replace an entry.
    pub fn insert_entry(&self, dn: &str, attributes: &[(&str, &[&str])]) {
        let entry = StoredEntry {
            dn: dn.to_string(),
            attributes: attributes
                .iter()
                .map(|(name, values)| {
                    let values: Vec<RawValue> = values.iter().map(|v| RawValue::from(*v)).collect();
                    (name.to_string(), values)
                })
                .collect(),
        };
        let mut state = self.state();
        match state.position(dn) {
            Some(idx) => state.entries[idx] = entry,
            None => state.entries.push(entry),
        }
    }

    /// Make the next request fail with `code`.
    pub fn fail_next(&self, code: u32, message: impl Into<String>) {
        self.state().fail_next = Some((code, message.into()));
    }

    /// Number of searches that reached the directory.
    pub fn search_count(&self) -> usize {
        self.state().searches
    }

    /// Writes accepted so far, oldest first.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Options applied so far.
    pub fn applied_options(&self) -> Vec<SessionOption> {
        self.state().options.clone()
    }

    /// DN of the current bind, if any.
    pub fn bound_as(&self) -> Option<String> {
        self.state().bound_as.clone()
    }

    /// Whether an entry exists.
    pub fn contains(&self, dn: &str) -> bool {
        self.state().position(dn).is_some()
    }

    /// Text values of one attribute of an entry.
    pub fn values(&self, dn: &str, attribute: &str) -> Option<Vec<String>> {
        let raw = self.raw_values(dn, attribute)?;
        Some(
            raw.iter()
                .filter_map(RawValue::as_text)
                .map(str::to_string)
                .collect(),
        )
    }

    /// Stored values of one attribute of an entry, binary included.
    pub fn raw_values(&self, dn: &str, attribute: &str) -> Option<Vec<RawValue>> {
        let state = self.state();
        let idx = state.position(dn)?;
        state.entries[idx].values(attribute).cloned()
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether the directory holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DirectoryTransport for MemoryTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn set_option(&mut self, option: &SessionOption) -> DirectoryResult<()> {
        match option {
            SessionOption::ProtocolVersion(v) if *v != 3 => {
                return Err(DirectoryError::InvalidConfiguration {
                    message: format!("protocol version {v} is not supported, only 3"),
                })
            }
            SessionOption::FollowReferrals(true) => {
                return Err(DirectoryError::InvalidConfiguration {
                    message: "client-side referral chasing is not supported".to_string(),
                })
            }
            _ => {}
        }
        self.state().options.push(option.clone());
        Ok(())
    }

    async fn bind(&mut self, bind_dn: &str, password: &str) -> DirectoryResult<()> {
        let mut state = self.state();
        if let Some((code, message)) = state.fail_next.take() {
            return Err(if code == RC_INVALID_CREDENTIALS {
                DirectoryError::AuthenticationFailed {
                    bind_dn: bind_dn.to_string(),
                }
            } else {
                DirectoryError::connection_failed(format!(
                    "bind failed with code {code}: {message}"
                ))
            });
        }

        let accepted = bind_dn.is_empty()
            || state.credentials.is_empty()
            || state.credentials.get(&dn_key(bind_dn)).map(String::as_str) == Some(password);
        if !accepted {
            return Err(DirectoryError::AuthenticationFailed {
                bind_dn: bind_dn.to_string(),
            });
        }

        state.bound_as = Some(bind_dn.to_string());
        Ok(())
    }

    async fn search(&mut self, params: &SearchParams) -> DirectoryResult<Vec<RawItem>> {
        let mut state = self.state();
        state.searches += 1;
        if let Some((code, message)) = state.fail_next.take() {
            return Err(DirectoryError::search_failed(code, message));
        }

        let filter = FilterExpr::parse(&params.filter)
            .map_err(|message| DirectoryError::search_failed(RC_FILTER_ERROR, message))?;

        let base = dn_key(&params.base_dn);
        if params.scope == SearchScope::Base && state.position(&params.base_dn).is_none() {
            return Err(DirectoryError::search_failed(
                RC_NO_SUCH_OBJECT,
                format!("no such object: {}", params.base_dn),
            ));
        }

        let limit = usize::try_from(params.size_limit).unwrap_or(0);
        let mut items = Vec::new();
        for entry in &state.entries {
            if !in_scope(&entry.key(), &base, params.scope) || !filter.matches(entry) {
                continue;
            }
            if limit > 0 && items.len() >= limit {
                debug!(limit, "Size limit reached");
                break;
            }
            items.push(RawItem::Entry(
                entry.project(&params.attributes, params.attrs_only),
            ));
        }
        Ok(items)
    }

    async fn add(&mut self, dn: &str, attributes: &AttributeSet) -> DirectoryResult<()> {
        let wire = wire_attributes(attributes)?;
        let mut state = self.state();
        if let Some((code, message)) = state.fail_next.take() {
            return write_outcome("add", dn, code, &message);
        }
        if state.position(dn).is_some() {
            return write_outcome("add", dn, RC_ALREADY_EXISTS, "entry already exists");
        }

        let mut entry = StoredEntry {
            dn: dn.to_string(),
            attributes: Vec::new(),
        };
        for (name, values) in wire {
            if !values.is_empty() {
                entry.set(&name, values);
            }
        }

        state.entries.push(entry);
        state.writes.push(RecordedWrite {
            op: "add",
            dn: dn.to_string(),
            attributes: attributes.clone(),
        });
        Ok(())
    }

    async fn modify(&mut self, dn: &str, changes: &AttributeSet) -> DirectoryResult<()> {
        let wire = wire_attributes(changes)?;
        let mut state = self.state();
        if let Some((code, message)) = state.fail_next.take() {
            return write_outcome("modify", dn, code, &message);
        }
        let Some(idx) = state.position(dn) else {
            return write_outcome("modify", dn, RC_NO_SUCH_OBJECT, "no such object");
        };

        let entry = &mut state.entries[idx];
        for (name, values) in wire {
            if values.is_empty() {
                entry.remove(&name);
            } else {
                entry.set(&name, values);
            }
        }

        state.writes.push(RecordedWrite {
            op: "modify",
            dn: dn.to_string(),
            attributes: changes.clone(),
        });
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        let mut state = self.state();
        if let Some((code, message)) = state.fail_next.take() {
            return write_outcome("delete", dn, code, &message);
        }
        let Some(idx) = state.position(dn) else {
            return write_outcome("delete", dn, RC_NO_SUCH_OBJECT, "no such object");
        };
        if state.has_children(dn) {
            return write_outcome(
                "delete",
                dn,
                RC_NOT_ALLOWED_ON_NON_LEAF,
                "entry has subordinates",
            );
        }

        state.entries.remove(idx);
        state.writes.push(RecordedWrite {
            op: "delete",
            dn: dn.to_string(),
            attributes: AttributeSet::new(),
        });
        Ok(())
    }

    async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> DirectoryResult<()> {
        let mut state = self.state();
        if let Some((code, message)) = state.fail_next.take() {
            return write_outcome("modify DN", dn, code, &message);
        }
        let Some(idx) = state.position(dn) else {
            return write_outcome("modify DN", dn, RC_NO_SUCH_OBJECT, "no such object");
        };

        let (old_rdn, old_parent) = split_dn(dn);
        let parent = new_parent.unwrap_or(old_parent);
        let new_dn = if parent.is_empty() {
            new_rdn.to_string()
        } else {
            format!("{new_rdn},{parent}")
        };
        let old_key = dn_key(dn);
        if dn_key(&new_dn) != old_key && state.position(&new_dn).is_some() {
            return write_outcome("modify DN", &new_dn, RC_ALREADY_EXISTS, "entry already exists");
        }

        let entry = &mut state.entries[idx];
        if delete_old_rdn {
            if let Some((attr, value)) = rdn_pair(old_rdn) {
                let mut remaining = entry.values(&attr).cloned().unwrap_or_default();
                remaining.retain(|v| v.as_text() != Some(value.as_str()));
                if remaining.is_empty() {
                    entry.remove(&attr);
                } else {
                    entry.set(&attr, remaining);
                }
            }
        }
        if let Some((attr, value)) = rdn_pair(new_rdn) {
            let mut values = entry.values(&attr).cloned().unwrap_or_default();
            let value = RawValue::Text(value);
            if !values.contains(&value) {
                values.push(value);
            }
            entry.set(&attr, values);
        }
        entry.dn = new_dn.clone();

        for other in state.entries.iter_mut() {
            if let Some(moved) = reparent(&other.dn, &old_key, &new_dn) {
                other.dn = moved;
            }
        }

        let mut attributes = AttributeSet::new().with("newrdn", new_rdn);
        if let Some(parent) = new_parent {
            attributes.set("newsuperior", parent);
        }
        state.writes.push(RecordedWrite {
            op: "rename",
            dn: dn.to_string(),
            attributes,
        });
        Ok(())
    }

    async fn unbind(&mut self) -> DirectoryResult<()> {
        self.state().bound_as = None;
        Ok(())
    }
}

/// Comparison form of a DN: RDNs trimmed and lowercased.
fn dn_key(dn: &str) -> String {
    let mut rdns = Vec::new();
    let mut rest = dn.trim();
    while !rest.is_empty() {
        let (rdn, parent) = split_dn(rest);
        rdns.push(rdn.to_lowercase());
        rest = parent;
    }
    rdns.join(",")
}

fn in_scope(key: &str, base: &str, scope: SearchScope) -> bool {
    match scope {
        SearchScope::Base => key == base,
        SearchScope::OneLevel => key != base && split_dn(key).1 == base,
        SearchScope::Subtree => {
            base.is_empty() || key == base || key.ends_with(&format!(",{base}"))
        }
    }
}

/// The DN `dn` takes once its ancestor `old_key` becomes `new_dn`.
fn reparent(dn: &str, old_key: &str, new_dn: &str) -> Option<String> {
    let mut rdns = Vec::new();
    let mut rest = dn;
    while !rest.is_empty() {
        if dn_key(rest) == old_key {
            if rdns.is_empty() {
                return None;
            }
            rdns.push(new_dn);
            return Some(rdns.join(","));
        }
        let (rdn, parent) = split_dn(rest);
        rdns.push(rdn);
        rest = parent;
    }
    None
}

/// Split `attr=value` and undo DN escaping in the value.
fn rdn_pair(rdn: &str) -> Option<(String, String)> {
    let (attr, escaped) = rdn.split_once('=')?;
    let bytes = escaped.as_bytes();
    let mut value = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(byte) => {
                    value.push(byte);
                    i += 3;
                }
                None => {
                    value.push(bytes[i + 1]);
                    i += 2;
                }
            }
        } else {
            value.push(bytes[i]);
            i += 1;
        }
    }
    Some((attr.trim().to_string(), String::from_utf8(value).ok()?))
}

#[derive(Debug, Clone, PartialEq)]
enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Present(String),
    Equal(String, String),
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
}

impl FilterExpr {
    fn parse(input: &str) -> Result<Self, String> {
        let mut parser = FilterParser {
            input: input.trim().as_bytes(),
            pos: 0,
        };
        let expr = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(format!("unexpected input after position {}", parser.pos));
        }
        Ok(expr)
    }

    fn matches(&self, entry: &StoredEntry) -> bool {
        match self {
            FilterExpr::And(filters) => filters.iter().all(|f| f.matches(entry)),
            FilterExpr::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            FilterExpr::Not(filter) => !filter.matches(entry),
            // Every entry has an object class
            FilterExpr::Present(attribute) if attribute.eq_ignore_ascii_case("objectClass") => {
                true
            }
            FilterExpr::Present(attribute) => entry.values(attribute).is_some_and(|v| !v.is_empty()),
            FilterExpr::Equal(attribute, expected) => {
                let expected = expected.to_lowercase();
                entry.any_value(attribute, |v| v.to_lowercase() == expected)
            }
            FilterExpr::Substring {
                attribute,
                initial,
                any,
                last,
            } => entry.any_value(attribute, |v| {
                substring_match(&v.to_lowercase(), initial.as_deref(), any, last.as_deref())
            }),
            FilterExpr::GreaterOrEqual(attribute, bound) => {
                entry.any_value(attribute, |v| compare_values(v, bound) != Ordering::Less)
            }
            FilterExpr::LessOrEqual(attribute, bound) => {
                entry.any_value(attribute, |v| compare_values(v, bound) != Ordering::Greater)
            }
        }
    }
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        match rest.strip_prefix(initial) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for piece in any {
        match rest.find(piece.as_str()) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }
    last.map_or(true, |last| rest.ends_with(last))
}

fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl FilterParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), String> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected '{}' at position {}", byte as char, self.pos))
        }
    }

    fn filter(&mut self) -> Result<FilterExpr, String> {
        self.expect(b'(')?;
        let expr = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                FilterExpr::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                FilterExpr::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                FilterExpr::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err("unexpected end of filter".to_string()),
        };
        self.expect(b')')?;
        Ok(expr)
    }

    fn list(&mut self) -> Result<Vec<FilterExpr>, String> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(format!("empty filter list at position {}", self.pos));
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<FilterExpr, String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'~' | b'<' | b'>' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attribute = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| "attribute name is not UTF-8".to_string())?
            .trim()
            .to_string();
        if attribute.is_empty() {
            return Err(format!("missing attribute at position {start}"));
        }

        let op = match self.peek() {
            Some(b'=') => b'=',
            Some(op @ (b'~' | b'<' | b'>')) => {
                self.pos += 1;
                op
            }
            _ => return Err(format!("missing operator at position {}", self.pos)),
        };
        self.expect(b'=')?;

        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'(' || b == b')' {
                break;
            }
            self.pos += 1;
        }
        let raw = &self.input[start..self.pos];

        let expr = match op {
            b'>' => FilterExpr::GreaterOrEqual(attribute, unescape(raw)?),
            b'<' => FilterExpr::LessOrEqual(attribute, unescape(raw)?),
            _ if raw == b"*" => FilterExpr::Present(attribute),
            _ if raw.contains(&b'*') => {
                let mut pieces: Vec<String> = raw
                    .split(|b| *b == b'*')
                    .map(|p| unescape(p).map(|s| s.to_lowercase()))
                    .collect::<Result<_, _>>()?;
                let last = pieces.pop().filter(|p| !p.is_empty());
                let initial = Some(pieces.remove(0)).filter(|p| !p.is_empty());
                pieces.retain(|p| !p.is_empty());
                FilterExpr::Substring {
                    attribute,
                    initial,
                    any: pieces,
                    last,
                }
            }
            // Approximate match is treated as equality
            _ => FilterExpr::Equal(attribute, unescape(raw)?),
        };
        Ok(expr)
    }
}

/// Undo RFC 4515 `\XX` escapes.
fn unescape(raw: &[u8]) -> Result<String, String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let byte = raw
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| format!("invalid escape at position {i}"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "filter value is not UTF-8".to_string())
}
