//! CLI entry point for nsbox.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};

use nsbox::cli::{Cli, Commands, InstallArgs, RunArgs};
use nsbox::config::{load_profile, OverlayMode};
use nsbox::error::SandboxError;
use nsbox::lifecycle::{clean_temp_files, LifecycleManager, Registration, Sandbox, StateLayout};
use nsbox::network::{dry_run_lines, netns_init, run_in_namespace};
use nsbox::sandbox::{check_bwrap, compile, run_direct, HostContext};
use nsbox::utils::init_debug_logging;

/// Sandbox holding persistent overlays when `--sandbox` is not given.
const DEFAULT_SANDBOX: &str = "default";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_debug_logging(cli.debug);

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("nsbox: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Install(args) => install(args),
        Commands::Uninstall { name } => uninstall(&name),
        Commands::List => list(),
        Commands::Clean => clean(),
        Commands::NetnsInit { plan } => Ok(netns_init(&plan).await?),
    }
}

fn manager() -> anyhow::Result<LifecycleManager> {
    Ok(LifecycleManager::new(StateLayout::for_user()?))
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = load_profile(&args.profile)
        .with_context(|| format!("loading profile '{}'", args.profile))?;
    let host = HostContext::current()?;
    args.apply(&mut config, &host.cwd)?;

    let needs_storage = config
        .overlays
        .iter()
        .any(|o| o.mode == OverlayMode::Persistent && o.write_dir.is_none());
    let sandbox = args
        .sandbox
        .clone()
        .or_else(|| needs_storage.then(|| DEFAULT_SANDBOX.to_string()));
    if let Some(name) = sandbox {
        let manager = manager()?;
        let registration = args.extra.registration(&args.profile, &host.cwd)?;
        let sandbox = manager
            .ensure_with(&name, registration)
            .with_context(|| format!("preparing sandbox '{}'", name))?;
        manager.apply_overlays(&sandbox, &mut config)?;
        tracing::debug!("Using sandbox '{}' at {}", name, sandbox.dir.display());
    }

    if args.dry_run {
        if config.network.mode.uses_namespace() {
            let self_exe = std::env::current_exe()?;
            for line in dry_run_lines(&config, &host, &self_exe)? {
                println!("{}", line);
            }
        } else {
            println!("{}", compile(&config, &host)?.to_shell_string());
        }
        return Ok(0);
    }

    check_bwrap().into_result()?;
    if config.network.mode.uses_namespace() {
        return Ok(run_in_namespace(&config, host).await?);
    }
    let plan = compile(&config, &host)?;
    Ok(run_direct(&plan).await?)
}

fn install(args: InstallArgs) -> anyhow::Result<i32> {
    let manager = manager()?;
    let mut sandbox = manager.get(&args.name)?;

    let extra = &args.extra;
    if args.profile.is_some() || !extra.binds.is_empty() || !extra.env.is_empty() {
        let cwd = std::env::current_dir()?;
        let record = &sandbox.record;
        let registration = Registration {
            profile: args.profile.clone().unwrap_or_else(|| record.profile.clone()),
            extra_binds: if extra.binds.is_empty() {
                record.extra_binds.clone()
            } else {
                extra.absolute_binds(&cwd)
            },
            extra_env: if extra.env.is_empty() {
                record.extra_env.clone()
            } else {
                extra.env_map()?
            },
        };
        sandbox = manager.update_registration(&args.name, registration)?;
    }

    let binary = match args.binary {
        Some(binary) => binary,
        None => choose_binary(&manager, &sandbox)?,
    };
    let handle = manager.install_wrapper(&sandbox, &binary)?;
    println!("Installed: {}", handle.path.display());

    let bin_dir = &manager.layout().bin_dir;
    if !on_path(bin_dir) {
        eprintln!("Note: {} is not on your PATH", bin_dir.display());
    }
    Ok(0)
}

fn choose_binary(manager: &LifecycleManager, sandbox: &Sandbox) -> anyhow::Result<PathBuf> {
    let found = manager.find_executables(sandbox)?;
    match found.len() {
        0 => bail!("no executables found in sandbox '{}'", sandbox.name),
        1 => return Ok(found[0].sandbox_path.clone()),
        _ => {}
    }

    println!("Executables in sandbox '{}':", sandbox.name);
    for (i, exe) in found.iter().enumerate() {
        println!("  {}. {}", i + 1, exe.sandbox_path.display());
    }
    print!("\nSelect binary (number): ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let choice: usize = line.trim().parse().context("invalid selection")?;
    found
        .get(choice.wrapping_sub(1))
        .map(|exe| exe.sandbox_path.clone())
        .context("invalid selection")
}

fn on_path(dir: &Path) -> bool {
    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).any(|p| p == dir))
        .unwrap_or(false)
}

fn uninstall(name: &str) -> anyhow::Result<i32> {
    let report = manager()?.uninstall(name).map_err(|e| {
        if let SandboxError::PartialUninstall { removed_wrappers, .. } = &e {
            for wrapper in removed_wrappers {
                println!("Removed: {}", wrapper.display());
            }
        }
        e
    })?;
    for wrapper in &report.removed_wrappers {
        println!("Removed: {}", wrapper.display());
    }
    if let Some(dir) = &report.removed_dir {
        println!("Removed: {}/", dir.display());
    }
    Ok(0)
}

fn list() -> anyhow::Result<i32> {
    let manager = manager()?;
    let listing = manager.list_all()?;

    if listing.sandboxes.is_empty() {
        println!("No sandboxes.");
    }
    for record in &listing.sandboxes {
        println!("{} (profile: {})", record.name, record.profile);
        println!("  overlays: {}", record.overlay_dir.display());
        for wrapper in &record.wrappers {
            println!("  wrapper:  {}", manager.layout().bin_dir.join(wrapper).display());
        }
    }

    if !listing.orphans.is_empty() {
        println!("\nOrphaned sandbox directories (remove with `nsbox uninstall <name>`):");
        for dir in &listing.orphans {
            println!("  {}", dir.display());
        }
    }
    Ok(0)
}

fn clean() -> anyhow::Result<i32> {
    let report = clean_temp_files(&std::env::temp_dir());
    for path in &report.removed {
        println!("  Removed: {}", path.display());
    }
    for (path, reason) in &report.failed {
        println!("  Error removing {}: {}", path.display(), reason);
    }
    for path in &report.skipped {
        println!("  In use: {}", path.display());
    }
    if report.removed.is_empty() && report.failed.is_empty() && report.skipped.is_empty() {
        println!("No temporary files found.");
    } else {
        println!("\nCleaned up {} temporary item(s).", report.removed.len());
    }
    Ok(if report.failed.is_empty() { 0 } else { 1 })
}
