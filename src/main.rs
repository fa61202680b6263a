//! packagefs - Layered package filesystem
//!
//! Usage:
//!   packagefs init                  - Write a default configuration
//!   packagefs mount <mount_point>   - Mount the filesystem
//!   packagefs unmount <mount_point> - Unmount the filesystem
//!   packagefs status                - Show layer status
//!   packagefs resolve <path>        - Show which physical file serves a path
//!   packagefs ls <path>             - Show a merged directory listing

use clap::{Parser, Subcommand};
use packagefs::{
    config::Config,
    fs::PackageFs,
    layer::{read_containers, Caller, Namespace, NamespaceRouter},
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "packagefs")]
#[command(author = "packagefs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Layered package filesystem merging user and system packages")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/packagefs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory (defaults to the configured one)
        mount_point: Option<PathBuf>,

        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show configuration and layer status
    Status,

    /// Show the physical path a read of <path> would use
    Resolve {
        /// Virtual path
        path: PathBuf,

        /// Resolve as this user id (defaults to the current user)
        #[arg(long)]
        uid: Option<u32>,
    },

    /// Show the merged listing of a virtual directory
    Ls {
        /// Virtual directory
        #[arg(default_value = "/")]
        path: PathBuf,

        /// List as this user id (defaults to the current user)
        #[arg(long)]
        uid: Option<u32>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init { force } => cmd_init(config_path, force),

        Commands::Mount {
            mount_point,
            foreground,
            allow_other,
        } => cmd_mount(config_path, mount_point, foreground, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Status => cmd_status(config_path),

        Commands::Resolve { path, uid } => cmd_resolve(config_path, &path, uid),

        Commands::Ls { path, uid } => cmd_ls(config_path, &path, uid),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        )));
    }

    info!("Initializing packagefs...");

    let config = Config::from_env();
    config.validate()?;

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("User layer template: {}", config.layers.user_root_template);
    info!("System layer: {:?}", config.layers.system_root);
    info!("");
    info!("Next step: run 'packagefs mount' to mount the filesystem");

    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    foreground: bool,
    allow_other: bool,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = mount_point;
    }
    config.mount.allow_other |= allow_other;

    info!("Starting packagefs...");
    info!("System layer: {:?}", config.layers.system_root);
    info!("User layer template: {}", config.layers.user_root_template);
    if config.cache.enabled {
        info!("Container cache enabled");
    }

    let router = Arc::new(NamespaceRouter::new(&config));
    let fs = PackageFs::new(router.clone(), &config);

    let mount_point = config.mount.mount_point.clone();
    std::fs::create_dir_all(&mount_point)?;

    info!("Mounting at {:?}", mount_point);

    // Build mount options
    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];

    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    } else if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }

    if !foreground {
        // No daemonization: the mount always runs in the foreground
        info!("Use 'packagefs unmount {:?}' to unmount", mount_point);
    }

    fuser::mount2(fs, &mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    if let Some(stats) = router.cache_stats() {
        info!(
            "Container cache: {} roots, {} hits, {} misses",
            stats.roots, stats.hits, stats.misses
        );
    }
    info!("Allocated {} new containers", router.allocator().counter());

    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let router = NamespaceRouter::new(&config);
    let caller = Caller::current();

    println!("packagefs Status");
    println!("================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Container prefix: {}", config.allocator.container_prefix);
    println!("New container interval: {}s", config.allocator.interval_secs);
    println!("Container cache: {}", if config.cache.enabled { "enabled" } else { "disabled" });
    println!();

    for layer in router.layers().read_layers(&caller) {
        match read_containers(&layer.root) {
            Ok(containers) => println!(
                "{:?} layer {:?}: {} containers",
                layer.role,
                layer.root,
                containers.len()
            ),
            Err(e) => println!("{:?} layer {:?}: unavailable ({})", layer.role, layer.root, e),
        }
    }

    if router.layers().primary(&caller).is_none() {
        match router.layers().user_root(&caller) {
            Some(root) => println!("Primary layer {:?}: not present", root),
            None => println!("Primary layer: none for uid {}", caller.uid),
        }
    }

    Ok(())
}

fn caller_for(uid: Option<u32>) -> Caller {
    match uid {
        Some(uid) => Caller::new(uid, uid),
        None => Caller::current(),
    }
}

fn cmd_resolve(config_path: &Path, path: &Path, uid: Option<u32>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let router = NamespaceRouter::new(&config);

    let physical = router.resolve_read(&caller_for(uid), path)?;
    println!("{}", physical.display());
    Ok(())
}

fn cmd_ls(config_path: &Path, path: &Path, uid: Option<u32>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let router = NamespaceRouter::new(&config);

    for entry in router.merge_listing(&caller_for(uid), path)? {
        let marker = if entry.metadata.is_dir() { "/" } else { "" };
        println!(
            "{}{}\t{}",
            entry.name.to_string_lossy(),
            marker,
            entry.physical_path.display()
        );
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
