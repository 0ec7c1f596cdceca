mod logging;
mod output;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use vhdm_core::{invoking_user, Config, VhdError, VhdSelector};
use vhdm_engine::{
    EngineSettings, FormatRequest, MountRequest, UnmountRequest, VhdManager,
};
use vhdm_host_linux::LinuxHost;
use vhdm_host_wsl::WslAttacher;
use vhdm_tracking::TrackingStore;

/// Attach, mount and track VHD files inside a WSL guest.
#[derive(Parser, Debug)]
#[command(name = "vhdm", version, about)]
struct Cli {
    /// Config file (default: ~/.config/vhdm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print a single summary line instead of a report
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct Target {
    /// VHD file, as C:\dir\disk.vhdx, C:/dir/disk.vhdx or /mnt/c/dir/disk.vhdx
    #[arg(long = "vhd-path")]
    vhd_path: Option<String>,

    /// Filesystem UUID
    #[arg(long)]
    uuid: Option<String>,

    /// Block device, e.g. sde or /dev/sde
    #[arg(long = "dev-name")]
    dev_name: Option<String>,
}

impl Target {
    fn selector(&self) -> VhdSelector {
        VhdSelector::new(
            self.vhd_path.clone(),
            self.uuid.clone(),
            self.dev_name.clone(),
        )
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach if needed and mount at a directory
    Mount {
        #[command(flatten)]
        target: Target,
        #[arg(long = "mount-point")]
        mount_point: String,
    },
    /// Attach without mounting
    Attach {
        #[command(flatten)]
        target: Target,
    },
    /// Unmount, optionally detaching as well
    Umount {
        #[command(flatten)]
        target: Target,
        #[arg(long = "mount-point")]
        mount_point: Option<String>,
        #[arg(long)]
        detach: bool,
    },
    /// Unmount if mounted, then detach
    Detach {
        #[command(flatten)]
        target: Target,
    },
    /// Show live and tracked state
    Status {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        json: bool,
    },
    /// Show recent detach events, newest first
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Create a filesystem on an attached VHD
    Format {
        #[command(flatten)]
        target: Target,
        #[arg(long = "type")]
        fs_type: Option<String>,
        /// Overwrite an existing filesystem
        #[arg(long)]
        force: bool,
    },
    /// Remove a VHD from the tracking file
    Forget {
        #[arg(long = "vhd-path")]
        vhd_path: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let vhd_error = err.downcast_ref::<VhdError>();
            if let Some(hint) = vhd_error.and_then(VhdError::hint) {
                eprintln!("hint: {hint}");
            }
            let code = vhd_error.map_or(1, VhdError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let owner = invoking_user().owner();
    let store = TrackingStore::open(&config, owner);
    let host = LinuxHost::default();
    let attacher = WslAttacher::new(config.wsl_exe.clone());
    let manager = VhdManager::new(
        &host,
        &attacher,
        &store,
        EngineSettings::from_config(&config, owner),
    );
    tracing::debug!(tracking_file = %store.path().display(), "starting");

    match &cli.command {
        Command::Mount {
            target,
            mount_point,
        } => {
            let report = manager
                .mount(&MountRequest {
                    selector: target.selector(),
                    mount_point: mount_point.clone(),
                })
                .context("mount")?;
            output::mount(&report, cli.quiet);
        }
        Command::Attach { target } => {
            let report = manager.attach(&target.selector()).context("attach")?;
            output::attach(&report, cli.quiet);
        }
        Command::Umount {
            target,
            mount_point,
            detach,
        } => {
            let report = manager
                .unmount(&UnmountRequest {
                    selector: target.selector(),
                    mount_point: mount_point.clone(),
                    detach: *detach,
                })
                .context("umount")?;
            output::unmount(&report, cli.quiet);
        }
        Command::Detach { target } => {
            let report = manager.detach(&target.selector()).context("detach")?;
            output::unmount(&report, cli.quiet);
        }
        Command::Status { target, json } => {
            let selector = target.selector();
            let selector = (!selector.is_empty()).then_some(selector);
            let entries = manager.status(selector.as_ref()).context("status")?;
            if *json {
                output::json(&entries)?;
            } else {
                output::status(&entries, cli.quiet);
            }
        }
        Command::History { limit, json } => {
            let entries = manager.history(*limit).context("history")?;
            if *json {
                output::json(&entries)?;
            } else {
                output::history(&entries);
            }
        }
        Command::Format {
            target,
            fs_type,
            force,
        } => {
            let report = manager
                .format(&FormatRequest {
                    selector: target.selector(),
                    fs_type: fs_type.clone(),
                    force: *force,
                })
                .context("format")?;
            output::format(&report, cli.quiet);
        }
        Command::Forget { vhd_path } => {
            let report = manager.forget(vhd_path).context("forget")?;
            output::forget(&report, cli.quiet);
        }
    }
    Ok(())
}
