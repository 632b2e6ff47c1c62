//! In-process implementation of the [`Backend`] primitives.
//!
//! `MemoryBackend` stands in for a Redis-family server: JSON entries with
//! lazy TTL expiration, native string sets, glob-pattern pub/sub fan-out,
//! and scan-evaluated secondary indexes. Per-key atomicity falls out of the
//! single state lock; there is no cross-key atomicity, matching the
//! contract real backends offer.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

use super::{Backend, IndexDefinition, IndexFieldKind, MessageStream};

/// A stored JSON document with its optional expiry (ms since epoch).
#[derive(Debug, Clone)]
struct JsonEntry {
    value: Value,
    expires_at: Option<i64>,
}

impl JsonEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// One registered pub/sub subscriber.
struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<(String, String)>,
}

#[derive(Default)]
struct State {
    json: HashMap<String, JsonEntry>,
    sets: HashMap<String, HashSet<String>>,
    indexes: HashMap<String, IndexDefinition>,
}

/// In-memory four-primitive store.
///
/// Cheap to construct and fully self-contained; the integration tests run
/// against it, and it is the default backend for
/// [`SyncBase::init`](crate::SyncBase::init).
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Drop the entry at `key` if its TTL has passed, then report whether a
    /// live value remains.
    fn live_entry<'a>(state: &'a mut State, key: &str, now: i64) -> Option<&'a mut JsonEntry> {
        if state.json.get(key).is_some_and(|e| e.is_expired(now)) {
            state.json.remove(key);
        }
        state.json.get_mut(key)
    }

    fn matches(pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn now_ms(&self) -> Result<i64> {
        Ok(Self::now())
    }

    async fn json_get(&self, key: &str) -> Result<Option<Value>> {
        let mut state = self.state.write();
        Ok(Self::live_entry(&mut state, key, Self::now()).map(|e| e.value.clone()))
    }

    async fn json_set(&self, key: &str, value: &Value, ttl_secs: i64) -> Result<()> {
        let expires_at = (ttl_secs > -1).then(|| Self::now() + ttl_secs * 1000);
        let mut state = self.state.write();
        state.json.insert(
            key.to_string(),
            JsonEntry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn json_set_path(&self, key: &str, path: &str, value: &Value) -> Result<bool> {
        let mut state = self.state.write();
        let Some(entry) = Self::live_entry(&mut state, key, Self::now()) else {
            return Ok(false);
        };
        Ok(apply_path(&mut entry.value, path, value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write();
        let existed = Self::live_entry(&mut state, key, Self::now()).is_some();
        state.json.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write();
        Ok(Self::live_entry(&mut state, key, Self::now()).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Self::now();
        let mut state = self.state.write();
        state.json.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = state
            .json
            .keys()
            .chain(state.sets.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        let mut state = self.state.write();
        let set = state.sets.entry(key.to_string()).or_default();
        Ok(members
            .iter()
            .filter(|m| set.insert((*m).clone()))
            .count())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_delete(&self, key: &str) -> Result<bool> {
        Ok(self.state.write().sets.remove(key).is_some())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        // Sending on a closed channel means the receiver went away; prune it.
        subscribers.retain(|sub| {
            if !Self::matches(&sub.pattern, channel) {
                return true;
            }
            match sub.tx.send((channel.to_string(), payload.to_string())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        Ok(delivered)
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        debug!(pattern, "registered subscriber");
        Ok(rx)
    }

    async fn index_create(&self, def: IndexDefinition) -> Result<()> {
        debug!(name = %def.name, prefix = %def.prefix, fields = def.fields.len(), "creating index");
        self.state.write().indexes.insert(def.name.clone(), def);
        Ok(())
    }

    async fn index_drop(&self, name: &str) -> Result<bool> {
        Ok(self.state.write().indexes.remove(name).is_some())
    }

    async fn index_search(&self, name: &str, query: &str, limit: usize) -> Result<Vec<Value>> {
        let (field, matcher) = parse_query(query)?;
        let now = Self::now();
        let mut state = self.state.write();
        let def = state
            .indexes
            .get(name)
            .ok_or_else(|| Error::index(format!("no such index: {name}")))?;
        let path = def
            .fields
            .iter()
            .find(|f| f.name == field)
            .ok_or_else(|| Error::query(format!("field `{field}` is not indexed")))?
            .path
            .clone();
        let prefix = def.prefix.clone();

        state.json.retain(|_, e| !e.is_expired(now));
        let mut hits: Vec<Value> = state
            .json
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, entry)| {
                resolve_path(&entry.value, &path).is_some_and(|v| matcher.matches(v))
            })
            .map(|(_, entry)| entry.value.clone())
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Write `value` at a `$.`-rooted dot path inside `root`.
///
/// Every intermediate segment must already exist and be an object; only the
/// final segment may be created. Mirrors the conditional semantics of a
/// JSON sub-document write on the real backend.
fn apply_path(root: &mut Value, path: &str, value: &Value) -> bool {
    let Some(path) = path.strip_prefix("$.") else {
        return false;
    };
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return false;
    }

    let mut cursor = root;
    for segment in &segments[..segments.len() - 1] {
        match cursor.get_mut(*segment) {
            Some(next) if next.is_object() => cursor = next,
            _ => return false,
        }
    }
    match cursor {
        Value::Object(map) => {
            map.insert(segments[segments.len() - 1].to_string(), value.clone());
            true
        }
        _ => false,
    }
}

/// Resolve a `$.`-rooted dot path inside a document.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.strip_prefix("$.")?
        .split('.')
        .try_fold(doc, |v, seg| v.get(seg))
}

enum Matcher {
    Tag(String),
    Range(f64, f64),
}

impl Matcher {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Tag(tag) => value.as_str() == Some(tag.as_str()),
            Self::Range(min, max) => value
                .as_f64()
                .is_some_and(|n| n >= *min && n <= *max),
        }
    }
}

/// Parse a single-term equality query: `@field:{tag}` or `@field:[min max]`.
///
/// Inside tag braces, punctuation must be backslash-escaped; a bare special
/// character is a syntax error. This is what makes escaping in the query
/// layer a correctness requirement rather than a cosmetic one.
fn parse_query(query: &str) -> Result<(String, Matcher)> {
    let rest = query
        .strip_prefix('@')
        .ok_or_else(|| Error::query(format!("query must start with `@`: {query}")))?;
    let (field, body) = rest
        .split_once(':')
        .ok_or_else(|| Error::query(format!("missing `:` in query: {query}")))?;
    if field.is_empty() {
        return Err(Error::query("empty field name"));
    }

    if let Some(inner) = body.strip_prefix('{').and_then(|b| b.strip_suffix('}')) {
        let tag = unescape_tag(inner)?;
        return Ok((field.to_string(), Matcher::Tag(tag)));
    }
    if let Some(inner) = body.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
        let mut bounds = inner.split_whitespace();
        let (min, max) = match (bounds.next(), bounds.next(), bounds.next()) {
            (Some(min), Some(max), None) => (min, max),
            _ => return Err(Error::query(format!("malformed range: {body}"))),
        };
        let min: f64 = min
            .parse()
            .map_err(|_| Error::query(format!("bad range bound: {min}")))?;
        let max: f64 = max
            .parse()
            .map_err(|_| Error::query(format!("bad range bound: {max}")))?;
        return Ok((field.to_string(), Matcher::Range(min, max)));
    }
    Err(Error::query(format!("malformed query body: {body}")))
}

fn unescape_tag(raw: &str) -> Result<String> {
    let mut tag = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => tag.push(escaped),
                None => return Err(Error::query("dangling escape in tag")),
            }
        } else if c.is_alphanumeric() || c == '_' {
            tag.push(c);
        } else {
            return Err(Error::query(format!("unescaped character `{c}` in tag")));
        }
    }
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::super::IndexField;
    use super::*;
    use serde_json::json;

    fn doc_value(id: &str, name: &str, age: i64) -> Value {
        json!({
            "id": id,
            "createdAt": 1,
            "createdBy": "tester",
            "updatedAt": 1,
            "updatedBy": "tester",
            "data": { "name": name, "age": age },
        })
    }

    fn test_index() -> IndexDefinition {
        IndexDefinition {
            name: "idx:users".to_string(),
            prefix: "app:DB:users:".to_string(),
            fields: vec![
                IndexField::new("id", "$.id", IndexFieldKind::Tag),
                IndexField::new("name", "$.data.name", IndexFieldKind::Tag),
                IndexField::new("age", "$.data.age", IndexFieldKind::Numeric),
            ],
        }
    }

    #[tokio::test]
    async fn test_json_roundtrip_and_delete() {
        let backend = MemoryBackend::new();
        let value = doc_value("d1", "alice", 30);

        backend.json_set("app:DB:users:d1", &value, -1).await.unwrap();
        assert_eq!(backend.json_get("app:DB:users:d1").await.unwrap(), Some(value));
        assert!(backend.exists("app:DB:users:d1").await.unwrap());

        assert!(backend.delete("app:DB:users:d1").await.unwrap());
        assert!(!backend.delete("app:DB:users:d1").await.unwrap());
        assert_eq!(backend.json_get("app:DB:users:d1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy_but_observable() {
        let backend = MemoryBackend::new();
        backend
            .json_set("k", &json!({"a": 1}), 0)
            .await
            .unwrap();
        // ttl of zero seconds expires immediately
        assert!(!backend.exists("k").await.unwrap());
        assert_eq!(backend.json_get("k").await.unwrap(), None);
        assert!(backend.scan("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_set_path_is_conditional() {
        let backend = MemoryBackend::new();

        // Missing key: no write.
        assert!(!backend
            .json_set_path("missing", "$.data.name", &json!("x"))
            .await
            .unwrap());

        backend
            .json_set("k", &doc_value("d1", "alice", 30), -1)
            .await
            .unwrap();

        // Existing parent: write lands.
        assert!(backend
            .json_set_path("k", "$.data.name", &json!("alicia"))
            .await
            .unwrap());
        let stored = backend.json_get("k").await.unwrap().unwrap();
        assert_eq!(stored["data"]["name"], json!("alicia"));

        // Missing intermediate segment: rejected, nothing created.
        assert!(!backend
            .json_set_path("k", "$.data.profile.city", &json!("oslo"))
            .await
            .unwrap());
        let stored = backend.json_get("k").await.unwrap().unwrap();
        assert!(stored["data"].get("profile").is_none());
    }

    #[tokio::test]
    async fn test_set_ops() {
        let backend = MemoryBackend::new();
        let members = vec!["a".to_string(), "b".to_string()];

        assert_eq!(backend.set_add("s", &members).await.unwrap(), 2);
        assert_eq!(backend.set_add("s", &members).await.unwrap(), 0);

        let mut got = backend.set_members("s").await.unwrap();
        got.sort();
        assert_eq!(got, vec!["a", "b"]);

        assert!(backend.set_delete("s").await.unwrap());
        assert!(!backend.set_delete("s").await.unwrap());
        assert!(backend.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_covers_documents_and_sets() {
        let backend = MemoryBackend::new();
        backend.json_set("p:DB:c:1", &json!({}), -1).await.unwrap();
        backend
            .set_add("p:DB:c:1_set", &["m".to_string()])
            .await
            .unwrap();
        backend.json_set("q:DB:c:2", &json!({}), -1).await.unwrap();

        let keys = backend.scan("p:DB:c:").await.unwrap();
        assert_eq!(keys, vec!["p:DB:c:1", "p:DB:c:1_set"]);
    }

    #[tokio::test]
    async fn test_publish_matches_exact_and_glob() {
        let backend = MemoryBackend::new();
        let mut exact = backend.subscribe("p:DB:c:1").await.unwrap();
        let mut glob = backend.subscribe("p:DB:c:*").await.unwrap();
        let mut other = backend.subscribe("p:DB:other:*").await.unwrap();

        let delivered = backend.publish("p:DB:c:1", "hello").await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(exact.recv().await.unwrap().1, "hello");
        assert_eq!(glob.recv().await.unwrap().1, "hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let backend = MemoryBackend::new();
        let rx = backend.subscribe("chan").await.unwrap();
        drop(rx);
        assert_eq!(backend.publish("chan", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_index_search_tag_and_numeric() {
        let backend = MemoryBackend::new();
        backend.index_create(test_index()).await.unwrap();
        backend
            .json_set("app:DB:users:d1", &doc_value("d1", "alice", 30), -1)
            .await
            .unwrap();
        backend
            .json_set("app:DB:users:d2", &doc_value("d2", "bob", 40), -1)
            .await
            .unwrap();
        // Outside the index prefix: never matched.
        backend
            .json_set("app:DB:rooms:r1", &doc_value("r1", "alice", 30), -1)
            .await
            .unwrap();

        let hits = backend
            .index_search("idx:users", "@name:{alice}", 1000)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], json!("d1"));

        let hits = backend
            .index_search("idx:users", "@age:[40 40]", 1000)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], json!("d2"));
    }

    #[tokio::test]
    async fn test_index_search_requires_escaping() {
        let backend = MemoryBackend::new();
        backend.index_create(test_index()).await.unwrap();
        backend
            .json_set("app:DB:users:d1", &doc_value("d1", "a.b@c-d", 1), -1)
            .await
            .unwrap();

        // Unescaped punctuation is a syntax error, not a silent miss.
        assert!(backend
            .index_search("idx:users", "@name:{a.b@c-d}", 1000)
            .await
            .is_err());

        let hits = backend
            .index_search("idx:users", r"@name:{a\.b\@c\-d}", 1000)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_index_drop_reports_absence() {
        let backend = MemoryBackend::new();
        assert!(!backend.index_drop("idx:users").await.unwrap());
        backend.index_create(test_index()).await.unwrap();
        assert!(backend.index_drop("idx:users").await.unwrap());
    }

    #[tokio::test]
    async fn test_search_unknown_field_errors() {
        let backend = MemoryBackend::new();
        backend.index_create(test_index()).await.unwrap();
        assert!(backend
            .index_search("idx:users", "@missing:{x}", 1000)
            .await
            .is_err());
    }
}
