use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A description of what to fetch: a URL plus a set of parameters.
///
/// Requests compare by value. The order in which parameters were added never matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, Value>,
}

impl QueryRequest {
    /// Creates a request for `url` without any parameters.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds (or replaces) all the given parameters.
    pub fn with_params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// The identity of a query inside the [`QueryCache`](crate::QueryCache).
///
/// A key is derived from a [`QueryRequest`] by writing a stable, human-readable description of
/// it (its metadata) and hashing that with SHA-256. Keys compare and hash by that digest only.
/// The request itself travels along with the key, so that a fetch can be started from nothing
/// but the key.
///
/// The special [idle](Self::idle) key stands for "nothing to request yet". Queries with the
/// idle key never fetch.
#[derive(Debug, Clone, Eq)]
pub struct QueryKey {
    metadata: Arc<str>,
    hash: Option<[u8; 32]>,
    request: Option<Arc<QueryRequest>>,
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for QueryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => {
                for b in hash {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            None => f.write_str("<idle>"),
        }
    }
}

impl QueryKey {
    /// The reserved key of a query that has nothing to request.
    pub fn idle() -> Self {
        Self {
            metadata: Arc::from(""),
            hash: None,
            request: None,
        }
    }

    /// Creates the [`QueryKey`] for the given request.
    pub fn from_request(request: &QueryRequest) -> Self {
        Self::builder(request).build()
    }

    /// Creates a [`QueryKeyBuilder`] for the given request.
    ///
    /// The builder can be used to mix additional stable metadata into the key, for example a
    /// tenant or user scope that the request itself does not mention.
    pub fn builder(request: &QueryRequest) -> QueryKeyBuilder {
        let mut builder = QueryKeyBuilder {
            metadata: String::new(),
            request: request.clone(),
        };
        builder.write_request_meta(request);
        builder
    }

    /// Whether this is the [idle](Self::idle) key.
    pub fn is_idle(&self) -> bool {
        self.hash.is_none()
    }

    /// Returns the human-readable metadata that forms the basis of the [`QueryKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The request this key was derived from, `None` for the idle key.
    pub fn request(&self) -> Option<&QueryRequest> {
        self.request.as_deref()
    }

    /// The URL of the request, `None` for the idle key.
    pub fn url(&self) -> Option<&str> {
        self.request().map(QueryRequest::url)
    }
}

/// Derives the key of an optional request; `None` yields the [idle](QueryKey::idle) key.
pub fn derive_key(request: Option<&QueryRequest>) -> QueryKey {
    request.map_or_else(QueryKey::idle, QueryKey::from_request)
}

/// A builder for [`QueryKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input is then hashed to form the [`QueryKey`].
pub struct QueryKeyBuilder {
    metadata: String,
    request: QueryRequest,
}

impl QueryKeyBuilder {
    fn write_request_meta(&mut self, request: &QueryRequest) {
        self.metadata.push_str("url: ");
        write_canonical(&mut self.metadata, &Value::String(request.url().to_owned()));
        self.metadata.push_str("\nparams: ");
        write_canonical_object(&mut self.metadata, request.params().iter());
        self.metadata.push('\n');
    }

    /// Finalize the [`QueryKey`].
    pub fn build(self) -> QueryKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        QueryKey {
            metadata: self.metadata.into(),
            hash: Some(hash),
            request: Some(Arc::new(self.request)),
        }
    }
}

impl fmt::Write for QueryKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Writes `value` as compact JSON, with the keys of every object in sorted order.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => write_canonical_object(out, map.iter()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            // `Display` on scalars cannot fail and yields their JSON form.
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_canonical_object<'a>(
    out: &mut String,
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
) {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    out.push('{');
    for (i, (name, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(out, &Value::String(name.clone()));
        out.push(':');
        write_canonical(out, value);
    }
    out.push('}');
}
