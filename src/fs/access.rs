// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Permission-bit arithmetic for requests the kernel cannot check itself.

/// Identity of a caller or of a file owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

const READ: u32 = 0o4;
const WRITE: u32 = 0o2;

/// Selects the rwx triad that applies to `caller`.
///
/// Owner bits when the uid matches, group bits when only the gid matches, the
/// "other" bits otherwise.
pub fn triad(caller: Identity, owner: Identity, mode: u32) -> u32 {
    if caller.uid == owner.uid {
        (mode >> 6) & 0o7
    } else if caller.gid == owner.gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    }
}

pub fn can_read(caller: Identity, owner: Identity, mode: u32) -> bool {
    triad(caller, owner, mode) >= READ
}

pub fn can_write(caller: Identity, owner: Identity, mode: u32) -> bool {
    triad(caller, owner, mode) & WRITE != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: Identity = Identity { uid: 1000, gid: 1000 };

    #[test]
    fn owner_with_rwx() {
        assert!(can_read(ALICE, ALICE, 0o700));
        assert!(can_write(ALICE, ALICE, 0o700));
    }

    #[test]
    fn owner_read_only() {
        assert!(can_read(ALICE, ALICE, 0o400));
        assert!(!can_write(ALICE, ALICE, 0o400));
    }

    #[test]
    fn stranger_uses_other_triad() {
        let stranger = Identity::new(2000, 2000);
        assert!(can_read(stranger, ALICE, 0o004));
        assert!(!can_write(stranger, ALICE, 0o004));
        assert!(!can_read(stranger, ALICE, 0o770));
    }

    #[test]
    fn group_member_uses_group_triad() {
        let member = Identity::new(2000, 1000);
        assert!(can_read(member, ALICE, 0o040));
        assert!(can_write(member, ALICE, 0o020));
        assert!(!can_read(member, ALICE, 0o404));
    }

    #[test]
    fn owner_match_ignores_wider_bits() {
        // owner triad decides even when group/other would allow
        assert!(!can_read(ALICE, ALICE, 0o077));
    }

    #[test]
    fn file_type_bits_are_ignored() {
        let dir_mode = 0o040744;
        assert!(can_read(ALICE, ALICE, dir_mode));
        let stranger = Identity::new(0, 0);
        assert!(can_read(stranger, ALICE, dir_mode));
        assert!(!can_write(stranger, ALICE, dir_mode));
    }

    #[test]
    fn execute_only_is_not_readable() {
        assert!(!can_read(ALICE, ALICE, 0o100));
        assert!(can_read(ALICE, ALICE, 0o500));
    }
}
