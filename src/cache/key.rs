//! Cache key generation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([?.!,;:])").expect("valid regex"));
static TRAILING_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?.!\s]+$").expect("valid regex"));

/// Fixed-length (64 hex chars) SHA-256 fingerprint of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey {
    pub hash: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Contextual inputs that accompany a request.
///
/// Only `stable` fields take part in the fingerprint. Anything that changes from
/// one request to the next for a trivial reason (timestamps, request ids, session
/// counters) belongs in `volatile`; hashing such fields fragments the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub stable: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub volatile: BTreeMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_stable(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.stable.insert(name.into(), value.into());
        self
    }
    pub fn with_volatile(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.volatile.insert(name.into(), value.into());
        self
    }

    /// SHA-256 over the canonical JSON of the stable fields.
    pub fn stable_hash(&self) -> String {
        let canonical = serde_json::to_string(&self.stable).unwrap_or_default();
        sha256_hex(canonical.as_bytes())
    }
}

/// A computed request as handed over by the request-building layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRequest {
    pub requester: String,
    pub prompt: String,
    #[serde(default)]
    pub context: RequestContext,
    pub request_class: String,
    pub model: String,
}

impl CacheRequest {
    pub fn new(
        requester: impl Into<String>,
        prompt: impl Into<String>,
        request_class: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            requester: requester.into(),
            prompt: prompt.into(),
            context: RequestContext::default(),
            request_class: request_class.into(),
            model: model.into(),
        }
    }
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// Trim, case-fold, collapse whitespace and drop trailing sentence punctuation.
pub fn normalize_prompt(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let collapsed = WHITESPACE.replace_all(lowered.trim(), " ");
    let tightened = SPACE_BEFORE_PUNCT.replace_all(&collapsed, "$1");
    TRAILING_PUNCT.replace(&tightened, "").into_owned()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Deterministic fingerprint generator. Pure; performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    salt: Option<String>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self { salt: None }
    }

    /// Mix a namespace/version salt into every key (bumping it orphans all prior entries).
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn fingerprint(
        &self,
        requester: &str,
        raw_request: &str,
        context: &RequestContext,
        request_class: &str,
        model: &str,
    ) -> CacheKey {
        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("requester", requester.to_string());
        parts.insert("request", normalize_prompt(raw_request));
        parts.insert("context", context.stable_hash());
        parts.insert("class", request_class.to_string());
        parts.insert("model", model.to_string());
        if let Some(ref s) = self.salt {
            parts.insert("salt", s.clone());
        }
        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        CacheKey::new(sha256_hex(canonical.as_bytes()))
    }

    pub fn fingerprint_request(&self, request: &CacheRequest) -> CacheKey {
        self.fingerprint(
            &request.requester,
            &request.prompt,
            &request.context,
            &request.request_class,
            &request.model,
        )
    }
}
