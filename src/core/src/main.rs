mod android;
mod cli;
mod features;
mod job;
mod module;
mod orchestrator;
mod runtime;
mod shell;
mod state;
mod toolkit;

use crate::android::{inspect, rootmgr};
use crate::cli::{Args, Command, FeaturesCommand};
use crate::features::{FeatureRegistry, fuzzy_match};
use crate::job::InputFileSet;
use crate::orchestrator::{MissingInputs, Orchestrator};
use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use crate::state::{ConsoleSink, ProgressSink};
use crate::toolkit::Installer;
use anyhow::{Result, bail};
use log::info;
use std::sync::Arc;
use tokio::runtime::Builder;

#[cfg(target_os = "android")]
fn init_logger() {
    use log::LevelFilter;

    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(if cfg!(debug_assertions) {
                LevelFilter::Trace
            } else {
                LevelFilter::Info
            })
            .with_tag("jarforge"),
    );
}

#[cfg(not(target_os = "android"))]
fn init_logger() {
    env_logger::init();
}

fn main() -> Result<()> {
    init_logger();

    let args = cli::parse_args();

    Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let shell = if args.no_su {
        RootShell::direct()
    } else {
        RootShell::su()?
    };
    if !args.no_su && !shell.is_root().await {
        bail!("root access denied");
    }

    let env = RuntimeEnvironment::device(args.assets);

    match args.command {
        Command::Patch {
            features,
            inputs,
            system_roles,
            install,
            to_downloads,
            reboot,
        } => {
            patch(
                &shell,
                &env,
                features,
                inputs,
                system_roles,
                install,
                to_downloads,
                reboot,
            )
            .await
        }
        Command::Features { command } => manage_features(&shell, &env, command),
        Command::Install => {
            let installer = Installer::new(&shell, &env);
            if !installer.install_if_needed(&|msg| info!("{msg}")).await? {
                bail!("toolkit installation failed");
            }
            Ok(())
        }
        Command::Info => show_info(&shell).await,
        Command::Cleanup => {
            shell.rm_rf(&env.scratch).await?;
            shell.rm_rf(&env.cache).await?;
            info!("scratch and cache removed");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn patch(
    shell: &RootShell,
    env: &RuntimeEnvironment,
    features: Vec<String>,
    explicit_inputs: Vec<(String, std::path::PathBuf)>,
    system_roles: Vec<String>,
    install: bool,
    to_downloads: bool,
    reboot: bool,
) -> Result<()> {
    let orchestrator = Orchestrator::new(shell, env);

    let mut inputs: InputFileSet = explicit_inputs.into_iter().collect();
    if !system_roles.is_empty() {
        inputs.extend(orchestrator.resolve_system_inputs(&system_roles).await?);
    }

    // nothing supplied: pull the selected features' required jars from the
    // live system
    if inputs.is_empty() {
        let registry = FeatureRegistry::new(shell, env);
        let mut roles: Vec<String> = Vec::new();
        for listing in registry.list_available()? {
            if !features
                .iter()
                .any(|id| fuzzy_match(&listing.id, &listing.metadata.name, id))
            {
                continue;
            }
            for role in &listing.metadata.required_inputs {
                if !roles.contains(role) {
                    roles.push(role.clone());
                }
            }
        }
        if !roles.is_empty() {
            inputs.extend(orchestrator.resolve_system_inputs(&roles).await?);
        }
    }

    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleSink);
    let module = match orchestrator
        .run_local_patch(&inputs, &features, &sink)
        .await
    {
        Ok(module) => module,
        Err(err) if err.downcast_ref::<MissingInputs>().is_some() => {
            bail!("{err}\nprovide them with --input ROLE=PATH or --system ROLE");
        }
        Err(err) => return Err(err),
    };

    println!("{}", module.path.display());

    if to_downloads {
        let dest = rootmgr::move_to_downloads(shell, &module.path).await?;
        info!("copied to {}", dest.display());
    }

    if install {
        let manager = rootmgr::detect(shell).await;
        info!("installing through {manager}");
        rootmgr::install_module(shell, manager, &module.path).await?;
        info!("module installed");

        if reboot {
            rootmgr::reboot(shell).await?;
        }
    }

    Ok(())
}

fn manage_features(
    shell: &RootShell,
    env: &RuntimeEnvironment,
    command: FeaturesCommand,
) -> Result<()> {
    let registry = FeatureRegistry::new(shell, env);

    match command {
        FeaturesCommand::List => {
            for listing in registry.list_available()? {
                println!(
                    "{:<40} [{}] {} (requires: {})",
                    listing.id,
                    listing.tier,
                    listing.metadata.name,
                    listing.metadata.required_inputs.join(", ")
                );
            }
        }
        FeaturesCommand::Import { path } => {
            let dest = registry.import_user_feature(&path)?;
            info!("imported {}", dest.display());
        }
        FeaturesCommand::Delete { id } => {
            if registry.delete_user_feature(&id)? {
                info!("deleted {id}");
            } else {
                bail!("no user feature named {id}");
            }
        }
    }

    Ok(())
}

async fn show_info(shell: &RootShell) -> Result<()> {
    let info = inspect::device_info(shell).await;
    println!("device:      {} ({})", info.device_name, info.device_codename);
    println!(
        "android:     {} (API {})",
        info.android_version, info.api_level
    );
    println!("build:       {}", info.version_name);
    println!("framework:   {}", present(info.has_framework_jar));
    println!("services:    {}", present(info.has_services_jar));
    println!("oem services: {}", present(info.has_oem_services_jar));

    let manager = rootmgr::detect(shell).await;
    match rootmgr::version_string(shell, manager).await {
        Some(version) => println!("root:        {version}"),
        None => println!("root:        {manager}"),
    }

    Ok(())
}

fn present(found: bool) -> &'static str {
    if found { "found" } else { "not found" }
}
