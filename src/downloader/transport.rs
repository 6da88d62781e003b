// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::DownloaderConfig,
    error::TransportError,
    model::{Method, Request},
};

/// A raw HTTP exchange result, transport-agnostic.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub url: String,
    pub elapsed: Duration,
}

/// Pluggable HTTP transport. A trait rather than a concrete client so the
/// retry/backoff/counter logic in `Downloader` is unit-testable against a
/// fake transport as well as against `ReqwestTransport` in integration
/// tests. No `async_trait` macro in the dependency stack this codebase
/// pulls from; a boxed future is the idiom used instead, mirroring
/// `src/client/common.rs::io_with_timeout`'s plain-`Future` bound.
pub trait Transport: Send + Sync {
    fn execute<'a>(
        &'a self,
        req: &'a Request,
        cancel: &'a CancellationToken,
    ) -> crate::model::request::BoxFuture<'a, Result<RawResponse, TransportError>>;
}

fn method_to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Options => reqwest::Method::OPTIONS,
        Method::Patch => reqwest::Method::PATCH,
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(cfg: &DownloaderConfig) -> anyhow::Result<Self> {
        let redirect_policy = if cfg.follow_redirects {
            reqwest::redirect::Policy::limited(cfg.max_redirects as usize)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .redirect(redirect_policy)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn execute<'a>(
        &'a self,
        req: &'a Request,
        cancel: &'a CancellationToken,
    ) -> crate::model::request::BoxFuture<'a, Result<RawResponse, TransportError>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(method_to_reqwest(req.method), req.url.as_str())
                .timeout(req.timeout);

            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if !req.cookies.is_empty() {
                let cookie_header = req
                    .cookies
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                builder = builder.header(reqwest::header::COOKIE, cookie_header);
            }
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }

            let start = Instant::now();
            let send = builder.send();

            let resp = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                res = send => res.map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout
                    } else if e.is_redirect() {
                        TransportError::RedirectOverflow
                    } else {
                        TransportError::Other(anyhow!(e))
                    }
                })?,
            };

            let status = resp.status().as_u16();
            let url = resp.url().to_string();
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();

            let body_fut = resp.bytes();
            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                res = body_fut => res.map_err(|e| TransportError::Other(anyhow!(e)))?.to_vec(),
            };

            Ok(RawResponse { status, headers, body, url, elapsed: start.elapsed() })
        })
    }
}
