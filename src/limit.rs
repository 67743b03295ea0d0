//! Limit definitions.
//!
//! A limit is stored in the shared store as one msgpack-encoded [`LimitEntry`]: a class id plus
//! an open attribute mapping. [`LimitRecord::from_entry`] validates the attributes the engine
//! understands and keeps everything else in `extra_attrs`, so entries written by newer tooling
//! still load.
//!
//! Behavior that varies per limit lives behind [`LimitClass`], resolved by class id through a
//! [`ClassRegistry`] when a snapshot is built.

use crate::engine::{Denial, Request};
use crate::error::ConfigError;
use crate::unit::TimeUnit;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// Class id of the built-in limit behavior.
pub const DEFAULT_CLASS: &str = "limit";

/// One attribute value in a stored limit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Serialized form of a limit, as kept in the ordered limit collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitEntry {
    pub class_id: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl LimitEntry {
    /// Decode one stored entry.
    pub fn decode(raw: &[u8]) -> Result<Self, ConfigError> {
        rmp_serde::from_slice(raw).map_err(|e| ConfigError::Decode(e.to_string()))
    }

    /// Encode as msgpack with named fields.
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        rmp_serde::to_vec_named(self).map_err(|e| ConfigError::Decode(e.to_string()))
    }
}

/// A validated rate rule.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitRecord {
    pub class_id: String,
    /// Stable identifier; generated when the stored entry has none.
    pub uuid: String,
    pub uri_template: String,
    /// Placeholder name to the regular expression its text must match.
    pub requirements: BTreeMap<String, String>,
    /// Upper-cased HTTP methods; empty matches every method.
    pub verbs: BTreeSet<String>,
    /// Requests allowed per `unit`.
    pub value: u64,
    pub unit: TimeUnit,
    /// Query arguments that must all be present for the limit to apply.
    pub queries: Vec<String>,
    /// Placeholders feeding the bucket key; empty uses every captured placeholder.
    pub use_params: Vec<String>,
    /// When false, limits after this one are skipped once it matched.
    pub continue_scan: bool,
    pub extra_attrs: BTreeMap<String, AttrValue>,
}

impl LimitRecord {
    /// A default-class limit allowing `value` requests per `unit` on `uri_template`.
    pub fn new(uri_template: impl Into<String>, value: u64, unit: TimeUnit) -> Self {
        Self {
            class_id: DEFAULT_CLASS.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            uri_template: uri_template.into(),
            requirements: BTreeMap::new(),
            verbs: BTreeSet::new(),
            value,
            unit,
            queries: Vec::new(),
            use_params: Vec::new(),
            continue_scan: true,
            extra_attrs: BTreeMap::new(),
        }
    }

    /// Use the class registered under `class_id`.
    pub fn with_class(mut self, class_id: impl Into<String>) -> Self {
        self.class_id = class_id.into();
        self
    }

    /// Stable identifier; stored entries without one get a derived id.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    /// Restrict to these methods (case-insensitive).
    pub fn with_verbs<I, S>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.verbs = verbs.into_iter().map(|v| v.as_ref().to_ascii_uppercase()).collect();
        self
    }

    /// Constrain placeholder `name` to text matching `pattern`.
    pub fn with_requirement(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.requirements.insert(name.into(), pattern.into());
        self
    }

    /// Apply only when every named query argument is present.
    pub fn with_queries<I: IntoIterator<Item = S>, S: Into<String>>(mut self, queries: I) -> Self {
        self.queries = queries.into_iter().map(Into::into).collect();
        self
    }

    /// Build the bucket key from these placeholders only.
    pub fn with_use<I: IntoIterator<Item = S>, S: Into<String>>(mut self, params: I) -> Self {
        self.use_params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Stop the walk after this limit when set to `false`.
    pub fn with_continue_scan(mut self, continue_scan: bool) -> Self {
        self.continue_scan = continue_scan;
        self
    }

    /// Set a class-specific attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.extra_attrs.insert(name.into(), value.into());
        self
    }

    /// Bucket capacity, in request-cost units.
    pub fn capacity(&self) -> f64 {
        self.value as f64
    }

    /// Units drained per second.
    pub fn refill_rate(&self) -> f64 {
        self.value as f64 / self.unit.as_secs() as f64
    }

    /// Decode and validate one stored entry.
    ///
    /// An entry without a `uuid` gets one derived from its bytes, so decoding the same
    /// entry twice yields equal records.
    pub fn decode(raw: &[u8]) -> Result<Self, ConfigError> {
        let entry = LimitEntry::decode(raw)?;
        Self::build(entry, || {
            let digest = Sha256::digest(raw);
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest[..16]);
            uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
        })
    }

    /// Validate an entry, generating a fresh `uuid` if it has none.
    pub fn from_entry(entry: LimitEntry) -> Result<Self, ConfigError> {
        Self::build(entry, || uuid::Uuid::new_v4().to_string())
    }

    fn build(entry: LimitEntry, fallback_id: impl FnOnce() -> String) -> Result<Self, ConfigError> {
        let LimitEntry { class_id, mut attrs } = entry;
        if class_id.is_empty() {
            return Err(ConfigError::Missing("class_id"));
        }

        let uri_template = match attrs.remove("uri") {
            Some(AttrValue::Text(uri)) if !uri.is_empty() => uri,
            Some(_) => return Err(invalid("uri", "expected a non-empty string")),
            None => return Err(ConfigError::Missing("uri")),
        };
        let value = match attrs.remove("value") {
            Some(AttrValue::Int(v)) if v > 0 => v as u64,
            Some(AttrValue::Int(_)) => return Err(invalid("value", "must be greater than 0")),
            Some(_) => return Err(invalid("value", "expected an integer")),
            None => return Err(ConfigError::Missing("value")),
        };
        let unit = match attrs.remove("unit") {
            Some(AttrValue::Text(raw)) => raw.parse::<TimeUnit>(),
            Some(AttrValue::Int(secs)) if secs > 0 => TimeUnit::from_secs(secs as u64),
            Some(AttrValue::Int(_)) => TimeUnit::from_secs(0),
            Some(_) => return Err(invalid("unit", "expected a unit name or seconds")),
            None => return Err(ConfigError::Missing("unit")),
        }
        .map_err(|e| invalid("unit", &e.to_string()))?;

        let uuid = match attrs.remove("uuid") {
            Some(AttrValue::Text(id)) if !id.is_empty() => id,
            Some(AttrValue::Text(_)) | None => fallback_id(),
            Some(_) => return Err(invalid("uuid", "expected a string")),
        };
        let verbs = take_strings(&mut attrs, "verbs")?
            .into_iter()
            .map(|v| v.to_ascii_uppercase())
            .collect();
        let requirements = match attrs.remove("requirements") {
            Some(AttrValue::Map(map)) => map
                .into_iter()
                .map(|(name, pattern)| match pattern {
                    AttrValue::Text(p) => Ok((name, p)),
                    _ => Err(invalid("requirements", "patterns must be strings")),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(invalid("requirements", "expected a mapping")),
            None => BTreeMap::new(),
        };
        let queries = take_strings(&mut attrs, "queries")?;
        let use_params = take_strings(&mut attrs, "use")?;
        let continue_scan = match attrs.remove("continue_scan") {
            Some(AttrValue::Bool(b)) => b,
            Some(_) => return Err(invalid("continue_scan", "expected a boolean")),
            None => true,
        };

        Ok(Self {
            class_id,
            uuid,
            uri_template,
            requirements,
            verbs,
            value,
            unit,
            queries,
            use_params,
            continue_scan,
            extra_attrs: attrs,
        })
    }

    /// The stored form of this record.
    pub fn to_entry(&self) -> LimitEntry {
        let mut attrs = self.extra_attrs.clone();
        attrs.insert("uuid".into(), self.uuid.clone().into());
        attrs.insert("uri".into(), self.uri_template.clone().into());
        attrs.insert("value".into(), AttrValue::Int(self.value as i64));
        attrs.insert("unit".into(), self.unit.to_string().into());
        attrs.insert("verbs".into(), text_list(self.verbs.iter()));
        attrs.insert(
            "requirements".into(),
            AttrValue::Map(
                self.requirements.iter().map(|(k, v)| (k.clone(), v.clone().into())).collect(),
            ),
        );
        attrs.insert("queries".into(), text_list(self.queries.iter()));
        attrs.insert("use".into(), text_list(self.use_params.iter()));
        attrs.insert("continue_scan".into(), self.continue_scan.into());
        LimitEntry { class_id: self.class_id.clone(), attrs }
    }
}

fn invalid(attr: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { attr: attr.to_string(), reason: reason.to_string() }
}

fn text_list<'a>(items: impl Iterator<Item = &'a String>) -> AttrValue {
    AttrValue::List(items.map(|s| AttrValue::Text(s.clone())).collect())
}

fn take_strings(
    attrs: &mut BTreeMap<String, AttrValue>,
    attr: &'static str,
) -> Result<Vec<String>, ConfigError> {
    match attrs.remove(attr) {
        None => Ok(Vec::new()),
        Some(AttrValue::List(items)) => items
            .iter()
            .map(|item| item.as_text().map(str::to_string).ok_or_else(|| invalid(attr, "expected strings")))
            .collect(),
        Some(_) => Err(invalid(attr, "expected a list of strings")),
    }
}

/// Serialize records in priority order, ready for [`SharedStore::put_limits`].
///
/// [`SharedStore::put_limits`]: crate::store::SharedStore::put_limits
pub fn encode_entries(records: &[LimitRecord]) -> Result<Vec<Vec<u8>>, ConfigError> {
    records.iter().map(|r| r.to_entry().encode()).collect()
}

/// Outcome of a class's extra acceptance check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Apply the limit; the map holds extra bucket-key components.
    Apply(BTreeMap<String, String>),
    /// The limit does not apply to this request.
    Skip,
}

/// Per-class behavior hooks.
///
/// Every hook has a default matching the built-in limit, so custom classes override only
/// what they change.
pub trait LimitClass: Send + Sync + Debug {
    /// URI template actually compiled for `record`.
    fn route(&self, record: &LimitRecord) -> String {
        record.uri_template.clone()
    }

    /// Extra acceptance check run after the verb and path matched.
    ///
    /// `params` holds the placeholders feeding the bucket key.
    fn filter(
        &self,
        _record: &LimitRecord,
        _request: &Request,
        _params: &BTreeMap<String, String>,
    ) -> FilterOutcome {
        FilterOutcome::Apply(BTreeMap::new())
    }

    /// Capacity consumed by one matching request.
    ///
    /// A cost above the limit's `value` is charged as `value`: such a request is admitted
    /// only into an empty bucket and then fills it.
    fn cost(&self, _record: &LimitRecord, _request: &Request) -> f64 {
        1.0
    }

    /// Build the client-visible denial.
    ///
    /// `next_allowed` is the wall-clock second at which the request would fit.
    fn format(
        &self,
        _record: &LimitRecord,
        status: &str,
        retry_after: u64,
        next_allowed: f64,
    ) -> Denial {
        let when = DateTime::<Utc>::from_timestamp(next_allowed.ceil() as i64, 0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        Denial {
            status: status.to_string(),
            retry_after,
            headers: vec![
                ("Retry-After".to_string(), retry_after.to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
            ],
            body: format!(
                "This request was rate-limited.  Please retry your request after {}.",
                when
            ),
        }
    }
}

/// The built-in class: no per-user differentiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseLimit;

impl LimitClass for BaseLimit {}

/// Class ids resolvable when building a snapshot.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    classes: HashMap<String, Arc<dyn LimitClass>>,
}

impl ClassRegistry {
    /// A registry holding only [`BaseLimit`] under [`DEFAULT_CLASS`].
    pub fn new() -> Self {
        let mut classes: HashMap<String, Arc<dyn LimitClass>> = HashMap::new();
        classes.insert(DEFAULT_CLASS.to_string(), Arc::new(BaseLimit));
        Self { classes }
    }

    /// Register `class` under `class_id`, replacing any previous one.
    pub fn register(&mut self, class_id: impl Into<String>, class: Arc<dyn LimitClass>) {
        self.classes.insert(class_id.into(), class);
    }

    pub fn get(&self, class_id: &str) -> Result<Arc<dyn LimitClass>, ConfigError> {
        self.classes
            .get(class_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownClass(class_id.to_string()))
    }

    /// Registered class ids, sorted.
    pub fn class_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.classes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(attrs: &[(&str, AttrValue)]) -> LimitEntry {
        LimitEntry {
            class_id: DEFAULT_CLASS.into(),
            attrs: attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn page_entry() -> LimitEntry {
        entry(&[
            ("uri", "/page/{pageid}".into()),
            ("value", AttrValue::Int(10)),
            ("unit", "second".into()),
            ("verbs", AttrValue::List(vec!["get".into()])),
            (
                "requirements",
                AttrValue::Map(BTreeMap::from([("pageid".to_string(), "[0-9]+".into())])),
            ),
            ("owner", "team-a".into()),
        ])
    }

    #[test]
    fn from_entry_reads_core_attributes() {
        let record = LimitRecord::from_entry(page_entry()).unwrap();
        assert_eq!(record.uri_template, "/page/{pageid}");
        assert_eq!(record.value, 10);
        assert_eq!(record.unit, TimeUnit::SECOND);
        assert_eq!(record.verbs, BTreeSet::from(["GET".to_string()]));
        assert_eq!(record.requirements.get("pageid").map(String::as_str), Some("[0-9]+"));
        assert!(record.continue_scan);
        assert!(!record.uuid.is_empty());
        assert_eq!(record.extra_attrs.get("owner"), Some(&AttrValue::from("team-a")));
    }

    #[test]
    fn missing_and_invalid_attributes_are_reported() {
        let err = LimitRecord::from_entry(entry(&[("uri", "/x".into()), ("unit", "second".into())]));
        assert_eq!(err, Err(ConfigError::Missing("value")));

        let err = LimitRecord::from_entry(entry(&[
            ("uri", "/x".into()),
            ("value", AttrValue::Int(0)),
            ("unit", "second".into()),
        ]));
        assert!(matches!(err, Err(ConfigError::Invalid { ref attr, .. }) if attr == "value"));

        let err = LimitRecord::from_entry(entry(&[
            ("uri", "/x".into()),
            ("value", AttrValue::Int(3)),
            ("unit", "fortnight".into()),
        ]));
        assert!(matches!(err, Err(ConfigError::Invalid { ref attr, .. }) if attr == "unit"));
    }

    #[test]
    fn integer_units_are_seconds() {
        let record = LimitRecord::from_entry(entry(&[
            ("uri", "/x".into()),
            ("value", AttrValue::Int(3)),
            ("unit", AttrValue::Int(90)),
        ]))
        .unwrap();
        assert_eq!(record.unit.as_secs(), 90);
        assert!((record.refill_rate() - 3.0 / 90.0).abs() < 1e-12);
    }

    #[test]
    fn entries_survive_msgpack() {
        let record = LimitRecord::from_entry(page_entry()).unwrap().with_use(["pageid"]);
        let raw = encode_entries(std::slice::from_ref(&record)).unwrap();
        let decoded = LimitRecord::from_entry(LimitEntry::decode(&raw[0]).unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn derived_uuid_is_stable() {
        let raw = page_entry().encode().unwrap();
        let a = LimitRecord::decode(&raw).unwrap();
        let b = LimitRecord::decode(&raw).unwrap();
        assert_eq!(a.uuid, b.uuid);
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(LimitEntry::decode(b"\xc1nope"), Err(ConfigError::Decode(_))));
    }

    #[test]
    fn registry_resolves_default_class_only() {
        let registry = ClassRegistry::new();
        assert!(registry.get(DEFAULT_CLASS).is_ok());
        assert!(matches!(registry.get("custom"), Err(ConfigError::UnknownClass(_))));
        assert_eq!(registry.class_ids(), vec![DEFAULT_CLASS.to_string()]);
    }

    #[test]
    fn default_format_names_next_time() {
        let record = LimitRecord::new("/x", 1, TimeUnit::SECOND);
        let denial = BaseLimit.format(&record, "413 Request Entity Too Large", 2, 1_700_000_001.2);
        assert_eq!(denial.retry_after, 2);
        assert!(denial.headers.contains(&("Retry-After".to_string(), "2".to_string())));
        assert!(denial.headers.contains(&("Content-Type".to_string(), "text/plain".to_string())));
        assert_eq!(
            denial.body,
            "This request was rate-limited.  Please retry your request after 2023-11-14T22:13:22Z."
        );
    }
}
