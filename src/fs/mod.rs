// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod access;
pub mod namespace;
pub mod passthrough;
pub mod session;

pub use passthrough::{PassthroughFs, PassthroughOptions, PathFilesystem, RequestContext};
pub use session::BridgeSession;
