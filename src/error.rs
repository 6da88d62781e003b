// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Small, matchable leaf errors. Everything else in this crate propagates as
//! `anyhow::Error` with context attached at each boundary crossing.

use thiserror::Error;

/// Failures from URL canonicalization.
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("url has no host: {0}")]
    MissingHost(String),
    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),
}

/// An HTTP method string that does not match one of the methods this engine
/// supports.
#[derive(Debug, Error)]
#[error("unsupported http method: {0}")]
pub struct MethodError(pub String);

/// Transport-layer failure from a downloader fetch attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    /// Too many redirect hops. Terminal and non-retryable (`SPEC_FULL.md`
    /// §7); never consumes a retry attempt.
    #[error("too many redirects")]
    RedirectOverflow,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
