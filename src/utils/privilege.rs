// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use nix::unistd::{Uid, geteuid, seteuid};

/// Holds an elevated effective uid until dropped.
///
/// The previous effective uid is restored on every exit path, including early
/// returns through `?`.
#[must_use = "privilege is released as soon as the guard is dropped"]
pub struct PrivilegeGuard {
    previous: Uid,
}

impl PrivilegeGuard {
    pub fn elevate() -> Result<Self> {
        let previous = geteuid();
        if !previous.is_root() {
            seteuid(Uid::from_raw(0)).context("Failed to assume elevated uid")?;
            tracing::debug!(from = previous.as_raw(), "privilege_elevated");
        }
        Ok(Self { previous })
    }

    pub fn previous(&self) -> Uid {
        self.previous
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if geteuid() == self.previous {
            return;
        }
        if let Err(e) = seteuid(self.previous) {
            tracing::error!(uid = self.previous.as_raw(), error = %e, "privilege_restore_failed");
        }
    }
}
