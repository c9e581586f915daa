// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod fs;
pub mod log;
pub mod poll;
pub mod privilege;

pub use self::{fs::*, log::*, poll::*, privilege::*};
