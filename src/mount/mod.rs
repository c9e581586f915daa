// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod backend;
pub mod signals;

pub use backend::{FuseBackend, MountBackend, MountFlag, MountHandle, MountSpec, ProcessBackend};
