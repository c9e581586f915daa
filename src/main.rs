// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later
mod conf;
mod core;
mod defs;
mod fs;
mod mount;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use conf::{
    cli::{Cli, Commands},
    cli_handlers,
};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenConfig { output } = &cli.command {
        return cli_handlers::handle_gen_config(output);
    }

    let mut config = cli_handlers::load_config(&cli)?;

    config.merge_with_cli(cli.data_root.clone(), cli.target.clone(), cli.verbose);

    if let Commands::ShowConfig = &cli.command {
        return cli_handlers::handle_show_config(&config);
    }

    // the log writer thread must not be a signal target
    if cli.command.holds_mounts() {
        mount::signals::block_termination()?;
    }

    let _log_guard = utils::init_logging(config.verbose, config.log_file.as_deref())
        .context("Failed to initialize logging")?;

    tracing::debug!(command = ?cli.command, "bridgefs_start");

    match &cli.command {
        Commands::Mount => cli_handlers::handle_mount(&config),
        Commands::Umount => cli_handlers::handle_umount(&config),
        Commands::Personal { action } => cli_handlers::handle_personal(&cli, &config, *action),
        Commands::Passthrough {
            fs_tag,
            nonempty,
            source,
            target,
        } => cli_handlers::handle_passthrough(&config, fs_tag, *nonempty, source, target),
        Commands::GenConfig { .. } | Commands::ShowConfig => Ok(()),
    }
}
