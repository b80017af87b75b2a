//! Command line parsing and validation.
//!
//! Besides the usual `-n N`/`--lines N`, the line count may be given in the
//! traditional `-N` form, which is rewritten before `clap` sees it.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::Parser;

use crate::cursor::normalize_line_count;
use crate::error::{Error, Result};

/// Most files followed at once; more would be too much to read.
pub const MAX_FILES: usize = 5;

#[derive(Debug, Parser)]
#[command(
    name = "tailf",
    about = "Show the last lines of files and follow them as they grow",
    disable_version_flag = true
)]
struct Cli {
    /// Files to follow (at most 5)
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Lines to show before following (default 5); `-N` is shorthand
    #[arg(short = 'n', long = "lines", value_name = "N", allow_negative_numbers = true)]
    lines: Option<i64>,

    /// Print version
    #[arg(short = 'v', long = "version")]
    version: bool,
}

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation {
    Follow(Config),
    Help(String),
    Version(String),
}

/// A validated request to follow files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Absolute paths of existing files, in command line order.
    pub files: Vec<PathBuf>,
    /// Lines shown before following.
    pub lines: usize,
}

impl Config {
    pub fn new(files: Vec<PathBuf>, lines: Option<i64>) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::NoFiles);
        }
        if files.len() > MAX_FILES {
            return Err(Error::TooManyFiles(files.len()));
        }

        let files = files
            .into_iter()
            .map(|file| {
                let path = absolute_file_path(&file).map_err(|_| Error::FileNotFound(file.clone()))?;
                match path.metadata() {
                    Ok(meta) if meta.is_dir() => Err(Error::NotAFile(path)),
                    Ok(_) => Ok(path),
                    Err(_) => Err(Error::FileNotFound(path)),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            files,
            lines: normalize_line_count(lines),
        })
    }

    /// Whether output lines are prefixed with their file's name.
    pub fn labelled(&self) -> bool {
        self.files.len() > 1
    }
}

/// Parses a full argument list, program name first.
pub fn parse<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let cli = match Cli::try_parse_from(expand_line_shorthand(args)) {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => return Ok(Invocation::Help(e.to_string())),
        Err(e) => return Err(e.into()),
    };

    if cli.version {
        return Ok(Invocation::Version(format!(
            "tailf {}",
            env!("CARGO_PKG_VERSION")
        )));
    }

    Config::new(cli.files, cli.lines).map(Invocation::Follow)
}

/// Rewrites `-N` into `--lines=N`, up to a `--` separator. The value given
/// to `-n`/`--lines` is left alone, so `--lines -4` still reaches `clap`.
fn expand_line_shorthand<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut positional_only = false;
    let mut value_expected = false;

    args.into_iter()
        .map(Into::into)
        .map(|arg: OsString| {
            if positional_only {
                return arg;
            }
            if std::mem::take(&mut value_expected) {
                return arg;
            }
            if arg == "--" {
                positional_only = true;
                return arg;
            }
            if arg == "-n" || arg == "--lines" {
                value_expected = true;
                return arg;
            }
            match arg.to_str().and_then(|s| s.strip_prefix('-')) {
                Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                    OsString::from(format!("--lines={}", digits))
                }
                _ => arg,
            }
        })
        .collect()
}

/// Makes `path` absolute by resolving its directory and keeping the file
/// name as given, so a symlinked file is followed by its own name.
fn absolute_file_path(path: &Path) -> io::Result<PathBuf> {
    let dir = match path.parent() {
        None => std::env::current_dir()?,
        Some(parent) if parent == Path::new("") => std::env::current_dir()?,
        Some(parent) => parent.to_path_buf(),
    };
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?;

    let dir = dir.canonicalize().unwrap_or(dir);

    Ok(dir.join(name))
}
