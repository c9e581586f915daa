// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod datadir;
pub mod manifest;
pub mod notify;
pub mod orchestrator;
pub mod personal;
pub mod topology;
pub mod watch;

pub use orchestrator::{MountOrchestrator, unmount_all};
pub use personal::PersonalFolderBridge;
