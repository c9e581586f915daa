// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};

use crate::{
    conf::{
        cli::{Cli, PersonalAction},
        config::Config,
    },
    core::{
        MountOrchestrator, PersonalFolderBridge,
        datadir::{self, DataLayout},
        notify::{CommandNotifier, CommandShell},
        orchestrator::{UnmountReport, unmount_all},
        personal::{self, PersonalOutcome, ProcMountProbe},
        topology,
    },
    defs,
    fs::{PassthroughOptions, access::Identity},
    mount::{FuseBackend, MountBackend, MountFlag, MountSpec, ProcessBackend, signals},
};

pub fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(config_path) = &cli.config {
        return Config::from_file(config_path).with_context(|| {
            format!(
                "Failed to load config from custom path: {}",
                config_path.display()
            )
        });
    }

    match Config::load_default() {
        Ok(config) => Ok(config),
        Err(e) => {
            let is_not_found = e
                .root_cause()
                .downcast_ref::<std::io::Error>()
                .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                .unwrap_or(false);

            if is_not_found {
                Ok(Config::default())
            } else {
                Err(e).context(format!(
                    "Failed to load default config from {}",
                    defs::CONFIG_FILE
                ))
            }
        }
    }
}

pub fn passthrough_options(config: &Config) -> PassthroughOptions {
    PassthroughOptions {
        bridge_marker: Some(PathBuf::from(&config.bridge_marker)),
        hidden_root_entry: Some(OsString::from(config.volumes_dir_name())),
        owner_reference: Some(OsString::from(&config.owner_reference)),
    }
}

fn log_unmount(report: &UnmountReport) {
    tracing::info!(
        unmounted = report.unmounted.len(),
        failed = report.failed.len(),
        removed = report.removed.len(),
        "umount_done"
    );
}

pub fn handle_gen_config(output: &Path) -> Result<()> {
    Config::default()
        .save_to_file(output)
        .with_context(|| format!("Failed to save generated config to {}", output.display()))
}

pub fn handle_show_config(config: &Config) -> Result<()> {
    let json = serde_json::to_string(config).context("Failed to serialize config to JSON")?;

    println!("{}", json);

    Ok(())
}

/// Volume specs in device-link order, followed by the data root.
fn mount_plan(config: &Config, layout: &DataLayout, media_owner: Identity) -> Result<Vec<MountSpec>> {
    let mut specs = topology::resolve(config).context("Failed to resolve volumes")?;
    let data_spec = datadir::prepare(
        layout,
        datadir::invoking_user(),
        media_owner,
        &config.fuse_name,
    )
    .context("Failed to prepare data root")?;
    specs.push(data_spec);
    Ok(specs)
}

pub fn handle_mount(config: &Config) -> Result<()> {
    let backend = Arc::new(FuseBackend::new(passthrough_options(config)));
    let layout = DataLayout::from_config(config)?;

    {
        let backend = Arc::clone(&backend);
        let target = layout.target.clone();
        let volumes_root = config.volumes_root.clone();
        signals::install(move || {
            match unmount_all(backend.as_ref(), Some(&target), &volumes_root) {
                Ok(report) => log_unmount(&report),
                Err(e) => tracing::error!(error = %format!("{e:#}"), "umount_failed"),
            }
        })?;
    }

    let specs = {
        let _privilege = backend.elevate()?;
        let media_owner = Identity::new(config.personal.media_owner, config.personal.media_owner);
        mount_plan(config, &layout, media_owner)?
    };

    tracing::info!(count = specs.len(), "mount_start");
    let report = MountOrchestrator::new(backend, config.stagger()).start(specs)?;
    if let Some(failed) = report.failed {
        bail!("Failed to mount {}", failed.display());
    }
    Ok(())
}

pub fn handle_umount(config: &Config) -> Result<()> {
    let backend = FuseBackend::new(passthrough_options(config));
    let target = match DataLayout::from_config(config) {
        Ok(layout) => Some(layout.target),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "data_target_unknown");
            None
        }
    };
    let report = unmount_all(&backend, target.as_deref(), &config.volumes_root)?;
    log_unmount(&report);
    Ok(())
}

fn second_stage_args(cli: &Cli) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = &cli.config {
        args.push("--config".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
    if cli.verbose {
        args.push("--verbose".to_string());
    }
    args
}

pub fn handle_personal(cli: &Cli, config: &Config, action: PersonalAction) -> Result<()> {
    let layout = DataLayout::from_config(config)?;
    let container_root = layout.data_root();
    let backend = Arc::new(ProcessBackend::current_exe(second_stage_args(cli))?);

    if action == PersonalAction::Umount {
        let report = personal::unmount_folders(
            backend.as_ref(),
            &container_root,
            config.personal.include_desktop,
        )?;
        log_unmount(&report);
        return Ok(());
    }

    if action == PersonalAction::Mount {
        let backend = Arc::clone(&backend);
        let container_root = container_root.clone();
        let include_desktop = config.personal.include_desktop;
        signals::install(move || {
            match personal::unmount_folders(backend.as_ref(), &container_root, include_desktop) {
                Ok(report) => log_unmount(&report),
                Err(e) => tracing::error!(error = %format!("{e:#}"), "umount_personal_failed"),
            }
        })?;
    }

    let bridge = PersonalFolderBridge::new(
        config.personal.clone(),
        datadir::home_dir()?,
        container_root,
        datadir::invoking_user(),
        backend,
        config.stagger(),
        Arc::new(ProcMountProbe),
        Arc::new(CommandShell::new(config.personal.container_shell.clone())),
        Arc::new(CommandNotifier::new(config.personal.notify_command.clone())),
    );

    match action {
        PersonalAction::Query => {
            println!("{}", bridge.query()?);
            Ok(())
        }
        _ => match bridge.mount()? {
            PersonalOutcome::AlreadyMounted => Ok(()),
            PersonalOutcome::Mounted(report) => match report.failed {
                Some(failed) => bail!("Failed to mount {}", failed.display()),
                None => Ok(()),
            },
        },
    }
}

pub fn handle_passthrough(
    config: &Config,
    fs_tag: &str,
    nonempty: bool,
    source: &Path,
    target: &Path,
) -> Result<()> {
    let mut spec = MountSpec::new(target, source, fs_tag);
    if nonempty {
        spec = spec.with_flag(MountFlag::NonEmpty);
    }
    tracing::info!(
        source = %source.display(),
        target_path = %target.display(),
        "passthrough_mount"
    );
    FuseBackend::new(passthrough_options(config))
        .attach(&spec)?
        .wait()
}
