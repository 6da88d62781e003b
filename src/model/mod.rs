//! The data model shared by every component: `Request`, `Response`,
//! `Record`, and `HostState`.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod host_state;
pub mod record;
pub mod request;
pub mod response;

pub use host_state::HostState;
pub use record::{Record, Sink};
pub use request::{Callback, CallbackItem, ErrBack, Method, Request, fingerprint_request};
pub use response::Response;
