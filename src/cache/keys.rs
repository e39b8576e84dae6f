//! Cache key derivation.
//!
//! A key is the request method, the resource identifier and the values of
//! every request header named by the resource's current [`VaryPolicy`].

use axum::http::{HeaderMap, Method, header};
use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};

/// Identifies one cached representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    resource: String,
    varied: Vec<(String, Option<String>)>,
}

impl CacheKey {
    /// Build a key from the request under the given policy.
    ///
    /// Headers named by the policy but missing from the request take part as
    /// `None`, so a request without `x-user` never shares a key with one that
    /// carries an empty `x-user`.
    pub fn new(method: &Method, resource: &str, headers: &HeaderMap, policy: &VaryPolicy) -> Self {
        let varied = policy
            .names()
            .iter()
            .map(|name| (name.clone(), header_value(headers, name)))
            .collect();

        Self {
            method: method.clone(),
            resource: resource.to_string(),
            varied,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn varied(&self) -> &[(String, Option<String>)] {
        &self.varied
    }
}

/// Request header names that select a representation of one resource.
///
/// Parsed from the most recent `Vary` response header seen for the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaryPolicy(Vec<String>);

impl VaryPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for name in names {
            policy.push(name.as_ref());
        }
        policy
    }

    /// Parse a `Vary` header value.
    ///
    /// Accepts both `,` and `;` as separators; peers written against older
    /// revisions of this layer joined names with `;`.
    pub fn parse(value: &str) -> Self {
        Self::new(value.split([',', ';']))
    }

    /// Read every `Vary` header of a response, or `None` when there is none.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut values = headers.get_all(header::VARY).into_iter().peekable();
        values.peek()?;

        let mut policy = Self::default();
        for value in values {
            for name in String::from_utf8_lossy(value.as_bytes()).split([',', ';']) {
                policy.push(name);
            }
        }
        Some(policy)
    }

    fn push(&mut self, name: &str) {
        let name = name.trim().to_ascii_lowercase();
        if !name.is_empty() && !self.0.contains(&name) {
            self.0.push(name);
        }
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a `Vary` header value.
    pub fn to_header_value(&self) -> String {
        self.0.join(", ")
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let mut values = headers.get_all(name).into_iter().peekable();
    values.peek()?;

    let joined = values
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect::<Vec<_>>()
        .join(", ");
    Some(joined)
}

/// Content-derived strong validator: quoted base64 of the body's SHA-256.
pub fn compute_etag(body: &[u8]) -> String {
    format!("\"{}\"", STANDARD.encode(Sha256::digest(body)))
}

/// Whether any `If-None-Match` candidate names `etag`.
///
/// Uses the weak comparison `If-None-Match` calls for, so `W/"x"` matches `"x"`.
pub fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    let wanted = strip_weak(etag);
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| strip_weak(candidate.trim()) == wanted)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}
