// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A structured extraction result produced by a callback and routed to a
/// persistence sink. The sink's storage format is out of scope for this
/// crate; `Record` is the stable shape crossing that boundary.
#[derive(Debug, Clone)]
pub struct Record {
    pub spider_name: String,
    pub source_url: String,
    pub status: u16,
    pub fields: HashMap<String, Value>,
    pub crawl_time: DateTime<Utc>,
}

/// `save(record) -> ok|err`. The core does not define the storage format;
/// implementations may buffer internally.
pub trait Sink: Send + Sync {
    fn save<'a>(
        &'a self,
        record: Record,
    ) -> crate::model::request::BoxFuture<'a, anyhow::Result<()>>;
}
