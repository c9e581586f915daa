// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::defs;

#[derive(Parser, Debug)]
#[command(
    name = "bridgefs",
    version,
    about = "Exposes host volumes and personal folders to an Android container"
)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    /// Host directory served at the data target.
    #[arg(short = 'd', long = "data-root")]
    pub data_root: Option<PathBuf>,
    #[arg(short = 't', long = "target")]
    pub target: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount the data root and every discovered volume, then serve until signalled.
    Mount,
    #[command(name = "umount")]
    Umount,
    Personal {
        #[command(subcommand)]
        action: PersonalAction,
    },
    /// Serve a single directory; used for the personal-folder second stage.
    Passthrough {
        #[arg(long = "fs-tag", default_value = defs::PERSONAL_FS_TAG)]
        fs_tag: String,
        #[arg(long)]
        nonempty: bool,
        source: PathBuf,
        target: PathBuf,
    },
    GenConfig {
        #[arg(short = 'o', long = "output", default_value = defs::CONFIG_FILE)]
        output: PathBuf,
    },
    ShowConfig,
}

impl Commands {
    /// Commands that keep mounts alive until a termination signal.
    pub fn holds_mounts(&self) -> bool {
        matches!(
            self,
            Commands::Mount
                | Commands::Personal {
                    action: PersonalAction::Mount
                }
        )
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonalAction {
    Mount,
    #[command(name = "umount")]
    Umount,
    Query,
}
