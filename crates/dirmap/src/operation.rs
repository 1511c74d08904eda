//! Record and query types
//!
//! Attribute values, canonical entries, search parameters and filters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Attribute name reserved for an entry's distinguished name.
pub const DN_ATTRIBUTE: &str = "dn";

/// Check whether an attribute name is the reserved `dn` key.
pub fn is_dn_attribute(name: &str) -> bool {
    name.eq_ignore_ascii_case(DN_ATTRIBUTE)
}

/// A value for an attribute, which may be single or multi-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value (null).
    Null,
    /// A single string value.
    String(String),
    /// A single integer value.
    Integer(i64),
    /// A single boolean value.
    Boolean(bool),
    /// A single floating-point value.
    Float(f64),
    /// Binary data.
    Binary(Vec<u8>),
    /// Multiple values, in directory order.
    Array(Vec<AttributeValue>),
    /// Nested map of values.
    Object(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Create a null value.
    pub fn null() -> Self {
        AttributeValue::Null
    }

    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Get as a string if this is a single string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as strings (works for both single and multi-valued).
    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            AttributeValue::String(s) => vec![s.as_str()],
            AttributeValue::Array(arr) => arr.iter().filter_map(|v| v.as_string()).collect(),
            _ => vec![],
        }
    }

    /// Get as an integer if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as a boolean if this is a boolean value.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as an array if this is multi-valued.
    pub fn as_array(&self) -> Option<&Vec<AttributeValue>> {
        match self {
            AttributeValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as a nested map.
    pub fn as_object(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            AttributeValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Check if this is multi-valued.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, AttributeValue::Array(_))
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Integer(i64::from(i))
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(bytes: Vec<u8>) -> Self {
        AttributeValue::Binary(bytes)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(vec: Vec<T>) -> Self {
        AttributeValue::Array(vec.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeValue {
    fn from(map: BTreeMap<String, AttributeValue>) -> Self {
        AttributeValue::Object(map)
    }
}

/// A set of attributes: record fields, write payloads and change sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    /// Map of attribute name to attribute value(s).
    #[serde(flatten)]
    attributes: HashMap<String, AttributeValue>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Set an attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Get a single-valued string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_string())
    }

    /// Get a multi-valued string attribute.
    pub fn get_strings(&self, name: &str) -> Option<Vec<&str>> {
        self.get(name).map(|v| v.as_strings())
    }

    /// Check if an attribute exists.
    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Get all attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|s| s.as_str())
    }

    /// Get the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over all attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }

    /// Convert to a HashMap.
    pub fn into_map(self) -> HashMap<String, AttributeValue> {
        self.attributes
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for AttributeSet {
    type Item = (String, AttributeValue);
    type IntoIter = std::collections::hash_map::IntoIter<String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.into_iter()
    }
}

/// A normalized directory entry: its DN plus name → value(s) attributes.
///
/// The DN lives outside the attribute map, so no attribute can shadow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    /// Distinguished name of the entry.
    pub dn: String,

    /// Attributes as returned by the directory.
    pub attributes: AttributeSet,
}

impl CanonicalEntry {
    /// Create an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: AttributeSet::new(),
        }
    }

    /// Add an attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.set(name, value);
        self
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Flatten into a single attribute set carrying the reserved `dn` key.
    pub fn to_attribute_set(&self) -> AttributeSet {
        let mut set = self.attributes.clone();
        set.set(DN_ATTRIBUTE, self.dn.clone());
        set
    }
}

/// Search breadth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// Exactly the base entry.
    Base,
    /// Immediate children of the base entry.
    #[serde(rename = "onelevel")]
    OneLevel,
    /// The base entry and all of its descendants.
    #[default]
    Subtree,
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchScope::Base => "base",
            SearchScope::OneLevel => "onelevel",
            SearchScope::Subtree => "subtree",
        };
        f.write_str(name)
    }
}

/// Alias dereferencing policy for searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefPolicy {
    #[default]
    Never,
    Searching,
    Finding,
    Always,
}

/// Filter that matches every entry.
pub const MATCH_ALL_FILTER: &str = "(objectClass=*)";

/// Immutable description of one directory query.
///
/// Field order is part of the cache key; two parameter sets are
/// cache-equivalent iff every field is identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchParams {
    /// Base DN of the search.
    pub base_dn: String,

    /// LDAP filter expression.
    pub filter: String,

    /// Requested attributes, in request order. Empty requests all user attributes.
    #[serde(default)]
    pub attributes: Vec<String>,

    /// Search scope.
    #[serde(default)]
    pub scope: SearchScope,

    /// Return attribute names without values.
    #[serde(default)]
    pub attrs_only: bool,

    /// Maximum entries to return (0 = server limit).
    #[serde(default)]
    pub size_limit: i32,

    /// Maximum seconds the server may spend (0 = server limit).
    #[serde(default)]
    pub time_limit: i32,

    /// Alias dereferencing.
    #[serde(default)]
    pub deref: DerefPolicy,
}

impl SearchParams {
    /// Create a subtree search with no limits.
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            filter: filter.into(),
            attributes: Vec::new(),
            scope: SearchScope::Subtree,
            attrs_only: false,
            size_limit: 0,
            time_limit: 0,
            deref: DerefPolicy::Never,
        }
    }

    /// Set the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the requested attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Request attribute names only.
    #[must_use]
    pub fn with_attrs_only(mut self, attrs_only: bool) -> Self {
        self.attrs_only = attrs_only;
        self
    }

    /// Set the size limit.
    #[must_use]
    pub fn with_size_limit(mut self, limit: i32) -> Self {
        self.size_limit = limit;
        self
    }

    /// Set the time limit in seconds.
    #[must_use]
    pub fn with_time_limit(mut self, limit: i32) -> Self {
        self.time_limit = limit;
        self
    }

    /// Set the alias dereferencing policy.
    #[must_use]
    pub fn with_deref(mut self, deref: DerefPolicy) -> Self {
        self.deref = deref;
        self
    }
}

/// Typed LDAP filter builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match entries where attribute equals value.
    Equals { attribute: String, value: String },

    /// Match entries where attribute contains value (substring).
    Contains { attribute: String, value: String },

    /// Match entries where attribute starts with value.
    StartsWith { attribute: String, value: String },

    /// Match entries where attribute ends with value.
    EndsWith { attribute: String, value: String },

    /// Match entries where attribute is greater than or equal to value.
    GreaterOrEqual { attribute: String, value: String },

    /// Match entries where attribute is less than or equal to value.
    LessOrEqual { attribute: String, value: String },

    /// Match entries where attribute has any value.
    Present { attribute: String },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical OR of multiple filters.
    Or { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Filter matching every entry.
    pub fn all() -> Self {
        Self::present("objectClass")
    }

    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a contains filter.
    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Contains {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a starts-with filter.
    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::StartsWith {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a present (attribute exists) filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create an AND filter.
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    /// Create an OR filter.
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    /// Create a NOT filter (negation).
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Render as an RFC 4515 filter string.
    pub fn to_ldap(&self) -> String {
        match self {
            Filter::And { filters } => {
                let inner: Vec<String> = filters.iter().map(Self::to_ldap).collect();
                format!("(&{})", inner.join(""))
            }
            Filter::Or { filters } => {
                let inner: Vec<String> = filters.iter().map(Self::to_ldap).collect();
                format!("(|{})", inner.join(""))
            }
            Filter::Not { filter } => format!("(!{})", filter.to_ldap()),
            Filter::Equals { attribute, value } => {
                format!("({}={})", attribute, escape_filter_value(value))
            }
            Filter::Contains { attribute, value } => {
                format!("({}=*{}*)", attribute, escape_filter_value(value))
            }
            Filter::StartsWith { attribute, value } => {
                format!("({}={}*)", attribute, escape_filter_value(value))
            }
            Filter::EndsWith { attribute, value } => {
                format!("({}=*{})", attribute, escape_filter_value(value))
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, escape_filter_value(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, escape_filter_value(value))
            }
            Filter::Present { attribute } => format!("({attribute}=*)"),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ldap())
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.to_ldap()
    }
}

/// Escape special characters in LDAP filter values (RFC 4515).
fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Escape special characters in DN attribute values (RFC 4514).
pub fn escape_dn_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut result = String::with_capacity(value.len() * 2);

    for (i, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if i == 0 || i == last => result.push_str("\\20"),
            '#' if i == 0 => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }

    result
}

/// A single relative distinguished name, e.g. `cn=Alice Smith`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    attribute: String,
    value: String,
}

impl Rdn {
    /// Create an RDN from an attribute and its unescaped value.
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Build the full DN of a child of `parent_dn` named by this RDN.
    pub fn under(&self, parent_dn: &str) -> String {
        if parent_dn.is_empty() {
            self.to_string()
        } else {
            format!("{self},{parent_dn}")
        }
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute, escape_dn_value(&self.value))
    }
}

/// Split off the first RDN of a DN, honoring backslash escapes.
///
/// Returns `(rdn, parent)`; the parent is empty for a single-RDN DN.
pub fn split_dn(dn: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return (dn[..i].trim(), dn[i + 1..].trim()),
            _ => escaped = false,
        }
    }
    (dn.trim(), "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_set() {
        let attrs = AttributeSet::new()
            .with("mail", "alice@example.com")
            .with("uidNumber", 1001i64)
            .with("active", true);

        assert_eq!(attrs.get_string("mail"), Some("alice@example.com"));
        assert_eq!(attrs.get("uidNumber").and_then(|v| v.as_integer()), Some(1001));
        assert_eq!(attrs.get("active").and_then(|v| v.as_boolean()), Some(true));
        assert!(!attrs.has("nonexistent"));
    }

    #[test]
    fn test_multi_valued_attribute() {
        let attrs = AttributeSet::new().with("cn", vec!["Alice", "A. Smith"]);
        assert_eq!(attrs.get_strings("cn").unwrap(), vec!["Alice", "A. Smith"]);
        assert!(attrs.get("cn").unwrap().is_multi_valued());
    }

    #[test]
    fn test_canonical_entry_cast_includes_dn() {
        let entry = CanonicalEntry::new("cn=Alice,dc=example").with("sn", "Smith");
        let set = entry.to_attribute_set();
        assert_eq!(set.get_string("dn"), Some("cn=Alice,dc=example"));
        assert_eq!(set.get_string("sn"), Some("Smith"));
        assert!(!entry.attributes.has("dn"));
    }

    #[test]
    fn test_filter_to_ldap() {
        assert_eq!(Filter::eq("cn", "John Doe").to_ldap(), "(cn=John Doe)");
        assert_eq!(Filter::all().to_ldap(), MATCH_ALL_FILTER);
        assert_eq!(
            Filter::and(vec![
                Filter::eq("objectClass", "person"),
                Filter::negate(Filter::eq("cn", "John")),
            ])
            .to_ldap(),
            "(&(objectClass=person)(!(cn=John)))"
        );
        assert_eq!(
            Filter::or(vec![Filter::starts_with("cn", "Jo"), Filter::contains("mail", "x")])
                .to_ldap(),
            "(|(cn=Jo*)(mail=*x*))"
        );
    }

    #[test]
    fn test_filter_feeds_search_params() {
        let params = SearchParams::new("dc=example", Filter::eq("cn", "a*b"));
        assert_eq!(params.filter, "(cn=a\\2ab)");
    }

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("John*"), "John\\2a");
        assert_eq!(escape_filter_value("(admin)"), "\\28admin\\29");
        assert_eq!(escape_filter_value("a\\b"), "a\\5cb");
    }

    #[test]
    fn test_escape_dn_value() {
        assert_eq!(escape_dn_value("John Doe"), "John Doe");
        assert_eq!(escape_dn_value("a,b"), "a\\,b");
        assert_eq!(escape_dn_value(" admin "), "\\20admin\\20");
        assert_eq!(escape_dn_value("#admin"), "\\23admin");
        assert_eq!(escape_dn_value("admin#1"), "admin#1");
        assert_eq!(escape_dn_value(""), "");
        assert_eq!(
            escape_dn_value("admin,dc=evil,dc=com"),
            "admin\\,dc\\=evil\\,dc\\=com"
        );
    }

    #[test]
    fn test_rdn_under_parent() {
        let rdn = Rdn::new("cn", "Smith, Alice");
        assert_eq!(rdn.to_string(), "cn=Smith\\, Alice");
        assert_eq!(rdn.under("ou=people,dc=example"), "cn=Smith\\, Alice,ou=people,dc=example");
    }

    #[test]
    fn test_split_dn() {
        assert_eq!(
            split_dn("cn=Alice,ou=people,dc=example"),
            ("cn=Alice", "ou=people,dc=example")
        );
        assert_eq!(
            split_dn("cn=Smith\\, Alice,dc=example"),
            ("cn=Smith\\, Alice", "dc=example")
        );
        assert_eq!(split_dn("dc=example"), ("dc=example", ""));
    }

    #[test]
    fn test_search_params_builder() {
        let params = SearchParams::new("dc=example", "(cn=*)")
            .with_scope(SearchScope::OneLevel)
            .with_attributes(["cn", "mail"])
            .with_size_limit(10);
        assert_eq!(params.scope, SearchScope::OneLevel);
        assert_eq!(params.attributes, vec!["cn", "mail"]);
        assert_eq!(params.size_limit, 10);
        assert_eq!(params.deref, DerefPolicy::Never);
    }

    #[test]
    fn test_scope_serialization() {
        assert_eq!(
            serde_json::to_string(&SearchScope::OneLevel).unwrap(),
            "\"onelevel\""
        );
        assert_eq!(SearchScope::default(), SearchScope::Subtree);
    }
}
