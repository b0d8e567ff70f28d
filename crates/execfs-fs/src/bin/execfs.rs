//! execfs: mount a directory where opening a file runs it.
//!
//! Every executable in the backing directory shows up as a readable file
//! whose content is the program's output, produced anew on each open.
//!
//! # Usage
//!
//! ```bash
//! execfs ~/status /mnt/status
//! cat /mnt/status/uptime
//! cat '/mnt/status/df?-h&/home'
//! fusermount -u /mnt/status
//! ```

use clap::{Parser, ValueEnum};
use env_logger::Env;
use execfs_fs::detach::{detach, Detached};
use execfs_fs::fuse::{self, MountOptions};
use execfs_fs::{ConfigFile, ExecFs, ExecFsConfig, SizePolicy, StderrPolicy};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// Mount a directory where opening a file executes it.
///
/// Reading an executable from the mount returns its output. Arguments can be
/// appended to the name: `prog?arg1&arg2`.
#[derive(Parser, Debug)]
#[command(name = "execfs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the executables
    #[arg(value_name = "BACKING")]
    backing: PathBuf,

    /// Where to mount the virtual tree
    #[arg(value_name = "MOUNTPOINT")]
    mount_point: PathBuf,

    /// Mount options (ro, rw, allow_other, or raw FUSE options)
    #[arg(short = 'o', value_name = "OPTIONS", value_delimiter = ',')]
    options: Vec<String>,

    /// Mount read-only: no stdin forwarding, no chmod
    #[arg(long)]
    read_only: bool,

    /// Stay in the foreground instead of detaching. Without it, log output
    /// still goes to stderr after the command returns.
    #[arg(short, long)]
    foreground: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Hide files without execute permission
    #[arg(long)]
    hide_non_exec: bool,

    /// What to do with the programs' standard error
    #[arg(long, value_enum)]
    stderr: Option<StderrArg>,

    /// Size reported before a file is opened
    #[arg(long, value_enum)]
    size: Option<SizeArg>,

    /// Wait up to this long for output a read asks for. With 0 (the
    /// default) a read past the output produced so far returns nothing,
    /// which most readers take as end of file; set this for programs that
    /// take time to print
    #[arg(long, value_name = "MS")]
    read_timeout_ms: Option<u64>,

    /// Time a program gets to exit on its own when its file is closed
    #[arg(long, value_name = "MS")]
    exit_grace_ms: Option<u64>,

    /// Time between SIGTERM and SIGKILL when a file is closed
    #[arg(long, value_name = "MS")]
    kill_grace_ms: Option<u64>,

    /// TOML configuration file; command line flags take precedence
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StderrArg {
    Merge,
    Discard,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SizeArg {
    Backing,
    Zero,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    if !args.backing.is_dir() {
        error!("Backing directory not found: {}", args.backing.display());
        process::exit(1);
    }
    if !args.mount_point.is_dir() {
        error!("Mount point not found: {}", args.mount_point.display());
        process::exit(1);
    }

    let (config, mount_options) = match build_config(&args) {
        Ok(built) => built,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let mount_point = match args.mount_point.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid mount point {}: {}", args.mount_point.display(), e);
            process::exit(1);
        }
    };

    let fs = match ExecFs::new(config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Failed to open backing directory: {}", e);
            process::exit(1);
        }
    };

    info!("Backing: {}", fs.root().display());
    info!("Mount point: {}", mount_point.display());
    debug!("Config: {:?}", fs.config());

    if args.foreground {
        if let Err(e) = fuse::mount(fs, &mount_point, &mount_options) {
            error!("{}", e);
            process::exit(1);
        }
    } else {
        run_detached(fs, &mount_point, &mount_options);
    }

    info!("Unmounted {}", mount_point.display());
}

/// Mount in a background process. The invoking process exits once the mount
/// has succeeded (0) or failed (1). Must run before any thread is started.
fn run_detached(fs: ExecFs, mount_point: &Path, options: &MountOptions) {
    let readiness = match detach() {
        Ok(Detached::Parent { child, mounted }) => {
            debug!("Background process {} mounted: {}", child, mounted);
            process::exit(if mounted { 0 } else { 1 });
        }
        Ok(Detached::Child(readiness)) => readiness,
        Err(e) => {
            error!("Failed to detach: {}", e);
            process::exit(1);
        }
    };

    let mut session = match fuse::attach(fs, mount_point, options) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            readiness.failed();
            process::exit(1);
        }
    };
    readiness.mounted();

    if let Err(e) = session.run() {
        error!("{}", e);
        process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<(ExecFsConfig, MountOptions), String> {
    let mut config = ExecFsConfig {
        backing_root: args.backing.clone(),
        ..Default::default()
    };
    let mut mount_options = MountOptions::default();

    if let Some(path) = &args.config {
        let file = ConfigFile::load(path).map_err(|e| e.to_string())?;
        file.apply(&mut config);
        mount_options.allow_other = file.allow_other.unwrap_or(false);
        info!("Loaded config from {}", path.display());
    }

    for option in &args.options {
        match option.as_str() {
            "ro" => config.read_only = true,
            "rw" => config.read_only = false,
            "allow_other" => mount_options.allow_other = true,
            "" => {}
            other => {
                warn!("Passing unknown mount option through: {}", other);
                mount_options.custom.push(other.to_string());
            }
        }
    }

    if args.read_only {
        config.read_only = true;
    }
    if args.allow_other {
        mount_options.allow_other = true;
    }
    if args.hide_non_exec {
        config.hide_non_executable = true;
    }
    if let Some(stderr) = args.stderr {
        config.session.stderr = match stderr {
            StderrArg::Merge => StderrPolicy::Merge,
            StderrArg::Discard => StderrPolicy::Discard,
        };
    }
    if let Some(size) = args.size {
        config.size_policy = match size {
            SizeArg::Backing => SizePolicy::Backing,
            SizeArg::Zero => SizePolicy::Zero,
        };
    }
    if let Some(ms) = args.read_timeout_ms {
        config.read_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = args.exit_grace_ms {
        config.reap.exit_grace = Duration::from_millis(ms);
    }
    if let Some(ms) = args.kill_grace_ms {
        config.reap.kill_grace = Duration::from_millis(ms);
    }

    mount_options.read_only = config.read_only;
    Ok((config, mount_options))
}
