// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Result;
use serde_json::Value;

use crate::{error::MethodError, model::record::Record};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A finite sequence of items a user callback yields besides consuming the
/// Response: either a new Request to admit, or a Record to hand to the
/// persistence sink.
#[derive(Debug, Clone)]
pub enum CallbackItem {
    Request(Request),
    Record(Record),
}

/// Invoked with a consumed Response, yields a finite list of `CallbackItem`s.
/// Boxed rather than expressed via an async-trait method: nothing in this
/// codebase's dependency stack pulls in an async-trait macro, and a plain
/// boxed closure returning a pinned future is the idiom used throughout.
pub type Callback =
    Arc<dyn Fn(crate::model::response::Response) -> BoxFuture<'static, Result<Vec<CallbackItem>>> + Send + Sync>;

/// Invoked on terminal failure for a Request, with the captured error.
pub type ErrBack = Arc<dyn Fn(&anyhow::Error, &Request) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = MethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "PATCH" => Ok(Method::Patch),
            other => Err(MethodError(other.to_string())),
        }
    }
}

/// A candidate or in-flight fetch. Comparable by `fingerprint`; see
/// `crate::url::fingerprint`.
#[derive(Clone)]
#[allow(clippy::struct_field_names)]
pub struct Request {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub cookies: HashMap<String, String>,
    /// Lower sorts earlier.
    pub priority: i64,
    pub retries_remaining: u32,
    pub delay: Duration,
    pub timeout: Duration,
    pub dont_filter: bool,
    pub callback: Option<Callback>,
    pub errback: Option<ErrBack>,
    pub cb_kwargs: HashMap<String, Value>,
    pub meta: HashMap<String, Value>,
    /// Non-owning back-reference: only the parent's canonical URL is kept,
    /// never the parent Request itself, so retired parents can be dropped
    /// without leaving a reference cycle.
    pub referer: Option<String>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("priority", &self.priority)
            .field("retries_remaining", &self.retries_remaining)
            .field("dont_filter", &self.dont_filter)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: None,
            cookies: HashMap::new(),
            priority: 0,
            retries_remaining: 0,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(30),
            dont_filter: false,
            callback: None,
            errback: None,
            cb_kwargs: HashMap::new(),
            meta: HashMap::new(),
            referer: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, Method::Get)
    }
}

/// Stable digest identifying a logical request: `H(method || canonical_url ||
/// body)`, per `crate::url::fingerprint`.
pub fn fingerprint_request(req: &Request) -> [u8; 20] {
    let canonical = crate::url::canonicalize::canonicalize(
        &req.url,
        &crate::url::canonicalize::CanonicalizeOpts::default(),
    )
    .unwrap_or_else(|_| req.url.clone());
    crate::url::fingerprint::fingerprint(req.method, &canonical, req.body.as_deref())
}
