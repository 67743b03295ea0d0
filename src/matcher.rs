//! Request matching and bucket keys.
//!
//! A [`Limit`] is a [`LimitRecord`] compiled against its class: the URI template becomes an
//! anchored [`Route`] regex and the class hooks are resolved once, so matching a request never
//! touches configuration errors.

use crate::engine::Request;
use crate::error::ConfigError;
use crate::limit::{ClassRegistry, FilterOutcome, LimitClass, LimitRecord};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

const DEFAULT_SEGMENT: &str = "[^/]+";
const KEY_PREFIX: &str = "bucket";

/// A URI template compiled to an anchored regular expression.
#[derive(Debug, Clone)]
pub struct Route {
    template: String,
    regex: Regex,
    placeholders: Vec<String>,
}

impl Route {
    /// Compile `template`; each `{name}` is constrained by `requirements[name]` when present.
    pub fn compile(
        template: &str,
        requirements: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::BadTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut pattern = String::from(r"\A");
        let mut placeholders: Vec<String> = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| bad("unclosed placeholder"))?;
            let name = &after[..close];
            if !is_group_name(name) {
                return Err(bad(&format!("invalid placeholder name {:?}", name)));
            }
            if placeholders.iter().any(|p| p == name) {
                return Err(bad(&format!("placeholder {:?} used twice", name)));
            }
            let constraint = match requirements.get(name) {
                Some(req) => {
                    // Validate on its own so the error names the placeholder.
                    Regex::new(req).map_err(|source| ConfigError::BadRequirement {
                        name: name.to_string(),
                        source,
                    })?;
                    req.as_str()
                }
                None => DEFAULT_SEGMENT,
            };
            pattern.push_str(&format!("(?P<{}>(?:{}))", name, constraint));
            placeholders.push(name.to_string());
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(bad("unmatched '}'"));
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push_str(r"\z");

        let regex = Regex::new(&pattern).map_err(|e| bad(&e.to_string()))?;
        Ok(Self { template: template.to_string(), regex, placeholders })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder names in template order.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Captured placeholder values if `path` matches the whole template.
    pub fn captures(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.placeholders
                .iter()
                .filter_map(|name| caps.name(name).map(|m| (name.clone(), m.as_str().to_string())))
                .collect(),
        )
    }
}

fn is_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identity of one shared bucket.
///
/// String form: `bucket:<class_id>:<template>` followed by one `/name=value` part per
/// parameter in name order, where values are JSON strings. `%`, `/`, `:` and `=` are
/// percent-escaped in every component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub class_id: String,
    pub template: String,
    pub params: BTreeMap<String, String>,
}

impl BucketKey {
    pub fn new(
        class_id: impl Into<String>,
        template: impl Into<String>,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self { class_id: class_id.into(), template: template.into(), params }
    }

    /// Parse the string form produced by `Display`.
    pub fn decode(key: &str) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::Invalid {
            attr: "bucket key".to_string(),
            reason: format!("{}: {:?}", reason, key),
        };

        let body = key
            .strip_prefix(KEY_PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| bad("missing prefix"))?;
        let mut parts = body.split('/');
        let head = parts.next().unwrap_or_default();
        let (class_id, template) = head.split_once(':').ok_or_else(|| bad("missing template"))?;

        let mut params = BTreeMap::new();
        for part in parts {
            let (name, value) = part.split_once('=').ok_or_else(|| bad("malformed parameter"))?;
            let json = unescape(value).ok_or_else(|| bad("bad escape"))?;
            let value: String =
                serde_json::from_str(&json).map_err(|e| bad(&format!("bad value ({})", e)))?;
            params.insert(unescape(name).ok_or_else(|| bad("bad escape"))?, value);
        }

        Ok(Self {
            class_id: unescape(class_id).ok_or_else(|| bad("bad escape"))?,
            template: unescape(template).ok_or_else(|| bad("bad escape"))?,
            params,
        })
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", KEY_PREFIX, escape(&self.class_id), escape(&self.template))?;
        for (name, value) in &self.params {
            // serializing a str cannot fail
            let json = serde_json::to_string(value).unwrap_or_default();
            write!(f, "/{}={}", escape(name), escape(&json))?;
        }
        Ok(())
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' | '/' | ':' | '=' => out.push_str(&format!("%{:02x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() != 2 {
                return None;
            }
            out.push(char::from(u8::from_str_radix(&hex, 16).ok()?));
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// A request matched against one limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub key: BucketKey,
    pub cost: f64,
    /// Every captured placeholder, including those left out of the key.
    pub params: BTreeMap<String, String>,
}

/// A limit ready for matching.
#[derive(Debug, Clone)]
pub struct Limit {
    record: LimitRecord,
    route: Route,
    class: Arc<dyn LimitClass>,
}

impl Limit {
    /// Resolve the record's class and compile its route.
    pub fn compile(record: LimitRecord, classes: &ClassRegistry) -> Result<Self, ConfigError> {
        let class = classes.get(&record.class_id)?;
        let route = Route::compile(&class.route(&record), &record.requirements)?;
        Ok(Self { record, route, class })
    }

    pub fn record(&self) -> &LimitRecord {
        &self.record
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn class(&self) -> &Arc<dyn LimitClass> {
        &self.class
    }

    /// Test `request` against this limit.
    ///
    /// Checks run cheapest first: verb, path, required query arguments, then the class filter.
    pub fn matches(&self, request: &Request) -> Option<Match> {
        let record = &self.record;
        if !record.verbs.is_empty() && !record.verbs.contains(&request.method.to_ascii_uppercase())
        {
            return None;
        }
        let params = self.route.captures(&request.path)?;
        if !record.queries.is_empty() {
            let present = request.query_names();
            if !record.queries.iter().all(|q| present.contains(q.as_str())) {
                return None;
            }
        }

        let mut key_params: BTreeMap<String, String> = if record.use_params.is_empty() {
            params.clone()
        } else {
            params
                .iter()
                .filter(|(name, _)| record.use_params.contains(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        match self.class.filter(record, request, &key_params) {
            FilterOutcome::Skip => return None,
            FilterOutcome::Apply(extra) => key_params.extend(extra),
        }

        Some(Match {
            key: BucketKey::new(record.class_id.clone(), record.uri_template.clone(), key_params),
            cost: self.class.cost(record, request),
            params,
        })
    }
}
