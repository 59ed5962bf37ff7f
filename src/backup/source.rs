use crate::core::{Result, StateError};
use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{Level, event};

/// What to capture: paths below `root`, minus anything under an excluded path.
/// All paths in `include` and `exclude` are relative to `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupPaths {
    pub root: PathBuf,
    pub include: Vec<PathBuf>,
    pub exclude: Vec<PathBuf>,
}

impl BackupPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn include(mut self, path: impl Into<PathBuf>) -> Self {
        self.include.push(path.into());
        self
    }

    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude.push(path.into());
        self
    }
}

/// One regular file selected for the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFile {
    /// `/`-separated path relative to the capture root
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Lists the files a backup should contain. Blocking; run off the async runtime.
pub trait FileEnumerator: Send + Sync {
    fn enumerate(&self, paths: &BackupPaths) -> Result<Vec<CapturedFile>>;
}

/// Produces database dump files inside a staging directory.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Returns the files written, all located directly in `staging`.
    async fn dump(&self, staging: &Path) -> Result<Vec<PathBuf>>;
}

// ============================================================================
// Directory walk
// ============================================================================

/// Recursive walk of the included paths. Symlinks are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryEnumerator;

impl FileEnumerator for DirectoryEnumerator {
    fn enumerate(&self, paths: &BackupPaths) -> Result<Vec<CapturedFile>> {
        if !paths.root.is_dir() {
            return Err(StateError::Capture(format!(
                "capture root {} is not a directory",
                paths.root.display()
            )));
        }
        let excluded = paths
            .exclude
            .iter()
            .map(|p| checked_relative(p))
            .collect::<Result<Vec<_>>>()?;

        let mut files = Vec::new();
        for include in &paths.include {
            let relative = checked_relative(include)?;
            let absolute = paths.root.join(&relative);
            let meta = fs::symlink_metadata(&absolute).map_err(|e| {
                StateError::Capture(format!("cannot read {}: {}", absolute.display(), e))
            })?;
            if meta.is_dir() {
                walk(&paths.root, &absolute, &excluded, &mut files)?;
            } else if meta.is_file() && !is_excluded(&relative, &excluded) {
                files.push(captured(&relative, absolute, meta.len())?);
            }
        }

        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        files.dedup_by(|a, b| a.relative == b.relative);
        event!(Level::DEBUG, files = files.len(), "capture enumerated");
        Ok(files)
    }
}

fn walk(root: &Path, dir: &Path, excluded: &[PathBuf], out: &mut Vec<CapturedFile>) -> Result<()> {
    let capture_err = |e: std::io::Error| StateError::Capture(format!("cannot list {}: {}", dir.display(), e));
    for entry in fs::read_dir(dir).map_err(capture_err)? {
        let entry = entry.map_err(capture_err)?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| StateError::Capture(format!("{} is outside the capture root: {}", path.display(), e)))?
            .to_path_buf();
        if is_excluded(&relative, excluded) {
            continue;
        }
        let file_type = entry.file_type().map_err(capture_err)?;
        if file_type.is_dir() {
            walk(root, &path, excluded, out)?;
        } else if file_type.is_file() {
            let size = entry.metadata().map_err(capture_err)?.len();
            out.push(captured(&relative, path, size)?);
        } else {
            event!(Level::DEBUG, path = %path.display(), "skipping non-regular file");
        }
    }
    Ok(())
}

/// Archive names are UTF-8, so a file whose name is not cannot be captured.
fn captured(relative: &Path, path: PathBuf, size: u64) -> Result<CapturedFile> {
    let relative = relative
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                StateError::Capture(format!("file name {} is not valid utf-8", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?
        .join("/");
    Ok(CapturedFile { relative, path, size })
}

fn is_excluded(relative: &Path, excluded: &[PathBuf]) -> bool {
    excluded.iter().any(|prefix| relative.starts_with(prefix))
}

/// Rejects paths that could leave the capture root.
fn checked_relative(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StateError::Capture(format!(
                    "backup path {} must be relative to the capture root",
                    path.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(StateError::Capture("backup path must not be empty".to_string()));
    }
    Ok(clean)
}

// ============================================================================
// External dump command
// ============================================================================

/// Runs an external program and captures its stdout as the dump file.
#[derive(Debug, Clone)]
pub struct CommandDumper {
    program: String,
    args: Vec<String>,
    output_name: String,
}

impl CommandDumper {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output_name: "database.dump".to_string(),
        }
    }

    /// Splits a shell-like command line on whitespace. No quoting support.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| StateError::InvalidInput("dump command must not be empty".to_string()))?;
        Ok(Self::new(program).args(parts))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }
}

#[async_trait]
impl DatabaseDumper for CommandDumper {
    async fn dump(&self, staging: &Path) -> Result<Vec<PathBuf>> {
        let target = staging.join(&self.output_name);
        let stdout = fs::File::create(&target)
            .map_err(|e| StateError::Dump(format!("cannot create {}: {}", target.display(), e)))?;

        event!(Level::INFO, program = %self.program, "running dump command");
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StateError::Dump(format!("cannot start {}: {}", self.program, e)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StateError::Dump(format!("{} did not finish: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StateError::Dump(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(vec![target])
    }
}
