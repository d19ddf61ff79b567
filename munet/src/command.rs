//! Utilities for invoking external programs (`ip`, `tc`, `mount`, `nsenter`,
//! container and VM engines). The engine shells out for every kernel
//! mutation; it never links the corresponding libraries.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("empty command provided")]
    Empty,
    #[error("io error running {argv:?}: {source}")]
    Io {
        argv: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("{argv:?} exited with {}: {}", .output.status, .output.stderr.trim())]
    NonZero { argv: Vec<String>, output: Output },
}

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

impl Output {
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

pub struct Runner;

impl Runner {
    /// Run the argv, capturing output. Fails on a non-zero exit status.
    pub async fn run<S: AsRef<str>>(argv: &[S]) -> Result<Output> {
        let output = Self::run_unchecked(argv).await?;
        if !output.status.success() {
            let argv = argv.iter().map(|s| s.as_ref().to_string()).collect::<Vec<_>>();
            tracing::debug!(?argv, status = ?output.status, stderr = %output.stderr.trim(),
                "command returned non-zero status");
            return Err(CommandError::NonZero { argv, output });
        }
        Ok(output)
    }

    /// Run the argv, capturing output regardless of exit status.
    pub async fn run_unchecked<S: AsRef<str>>(argv: &[S]) -> Result<Output> {
        let argv_owned: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        let (program, args) = argv_owned.split_first().ok_or(CommandError::Empty)?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::trace!(argv = ?argv_owned, "running command");

        let output = cmd
            .output()
            .await
            .map_err(|source| CommandError::Io { argv: argv_owned.clone(), source })?;

        Ok(output.into())
    }

    /// Run a command given as one string, split on whitespace.
    pub async fn run_str(cmd: &str) -> Result<Output> {
        let argv: Vec<&str> = cmd.split_ascii_whitespace().collect();
        if argv.is_empty() {
            return Err(CommandError::Empty);
        }
        Self::run(&argv).await
    }
}

/// Prefix an argv so it executes inside the namespaces held by `pid`
/// (network, mount, UTS and PID).
pub fn nsenter_args<S: AsRef<str>>(pid: u32, argv: &[S]) -> Vec<String> {
    let mut full: Vec<String> =
        vec!["nsenter".into(), "-t".into(), pid.to_string(), "-n".into(), "-m".into(), "-u".into(), "-p".into()];
    full.extend(argv.iter().map(|s| s.as_ref().to_string()));
    full
}

/// Prefix an argv so it executes only inside the network namespace of `pid`.
pub fn netns_args<S: AsRef<str>>(pid: u32, argv: &[S]) -> Vec<String> {
    let mut full: Vec<String> = vec!["nsenter".into(), "-t".into(), pid.to_string(), "-n".into()];
    full.extend(argv.iter().map(|s| s.as_ref().to_string()));
    full
}

/// Locate an executable on `PATH`, like `which`.
pub fn find_executable(name: impl AsRef<OsStr>) -> Option<PathBuf> {
    let name = name.as_ref();
    if Path::new(name).components().count() > 1 {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).map(|dir| dir.join(name)).find(|p| p.is_file())
}
