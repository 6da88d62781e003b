// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A polite, concurrent web crawling engine: a frontier scheduler, a
//! retrying downloader, a per-host circuit breaker, and a spider driver
//! that couples them together behind a signal bus.

pub mod cfg;
pub mod circuit;
pub mod downloader;
pub mod driver;
pub mod error;
pub mod frontier;
pub mod model;
pub mod stats;
pub mod url;
