//! zipfs-mount: mount a ZIP archive as a read-write filesystem.
//!
//! Changes made under the mountpoint are written back into the archive
//! when the filesystem is unmounted.
//!
//! # Usage
//!
//! ```bash
//! zipfs-mount archive.zip /mnt/archive
//! fusermount -u /mnt/archive   # commits the changes
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use zipfs_fs::{fuse, FsTree};

/// Mount a ZIP archive as a filesystem.
///
/// The archive is created if it does not exist (unless mounted
/// read-only). All modifications are committed when the filesystem is
/// unmounted.
#[derive(Parser, Debug)]
#[command(name = "zipfs-mount")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the ZIP archive
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Directory to mount the archive on
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Open the archive in read-only mode
    #[arg(short = 'r', long = "readonly")]
    readonly: bool,

    /// Don't detach from the terminal
    #[arg(short = 'f')]
    foreground: bool,

    /// Turn on debug logging, also implies -f
    #[arg(short = 'd')]
    debug: bool,

    /// Prompt for the archive password
    #[arg(short = 'p')]
    use_password: bool,

    /// Mount options passed through to the kernel
    #[arg(short = 'o', value_name = "OPT", value_delimiter = ',')]
    options: Vec<String>,
}

const PASSWORD_ATTEMPTS: usize = 3;

fn main() -> ExitCode {
    let mut args = Args::parse();
    if args.debug {
        args.foreground = true;
    }

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    // "-o ro" is equivalent to -r and must not reach the kernel twice
    let read_only = args.readonly || args.options.iter().any(|o| o == "ro");
    args.options.retain(|o| o != "ro");

    info!("opening archive: {}", args.archive.display());
    let mut tree = match FsTree::mount(&args.archive, read_only) {
        Ok(tree) => tree,
        Err(e) => {
            error!("cannot open zip archive {}: {e}", args.archive.display());
            return ExitCode::FAILURE;
        }
    };

    if args.use_password && !unlock(&mut tree) {
        error!("giving up after {PASSWORD_ATTEMPTS} password attempts");
        return ExitCode::FAILURE;
    }

    if !args.foreground {
        let cwd = match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(e) => {
                error!("cannot determine working directory: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = daemonize::Daemonize::new().working_directory(cwd).start() {
            error!("unable to detach from terminal: {e}");
            return ExitCode::FAILURE;
        }
    }

    match fuse::mount(tree, &args.mountpoint, read_only, &args.options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn unlock(tree: &mut FsTree) -> bool {
    for _ in 0..PASSWORD_ATTEMPTS {
        match rpassword::prompt_password("Enter password: ") {
            Ok(password) => {
                if tree.try_passwd(&password) {
                    return true;
                }
                eprintln!("Incorrect!");
            }
            Err(e) => {
                error!("cannot read password: {e}");
                return false;
            }
        }
    }
    false
}
