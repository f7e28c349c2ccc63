//! Artifact storage.
//!
//! Artifacts live in `<family>/<state>/<name>` under the repository root.
//! The engine only touches them through `ArtifactStore`, so tests and
//! alternative backends can stand in for the filesystem.

use crate::errors::ReviewError;
use crate::workflow_config::WorkflowToml;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Where an artifact sits in its family lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Root-relative path
    pub path: PathBuf,
    pub family: String,
    pub state: String,
    /// File stem, used as the feature name
    pub feature: String,
}

impl Artifact {
    /// Classify a root-relative path by family and state.
    pub fn locate(workflow: &WorkflowToml, path: &Path) -> Result<Self, ReviewError> {
        let feature = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ReviewError::Configuration(format!("artifact path has no file name: {}", path.display()))
            })?;

        let best = workflow
            .families
            .iter()
            .filter_map(|(name, family)| {
                let rest = path.strip_prefix(&family.dir).ok()?;
                let mut components = rest.components();
                let Some(Component::Normal(state)) = components.next() else {
                    return None;
                };
                let state = state.to_string_lossy().to_string();
                // The file itself must follow the state directory.
                components.next()?;
                family.state_index(&state)?;
                Some((family.dir.components().count(), name.clone(), state))
            })
            .max_by_key(|(depth, _, _)| *depth);

        match best {
            Some((_, family, state)) => Ok(Self {
                path: path.to_path_buf(),
                family,
                state,
                feature,
            }),
            None => Err(ReviewError::Configuration(format!(
                "{} is not inside any configured family state directory",
                path.display()
            ))),
        }
    }
}

/// Storage operations the engine needs. All paths are root-relative.
pub trait ArtifactStore: Send + Sync {
    fn root(&self) -> &Path;

    fn exists(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> Result<String, ReviewError>;

    /// Move an artifact. Fails if `to` already exists.
    fn relocate(&self, from: &Path, to: &Path) -> Result<(), ReviewError>;

    /// Write a new file at `path`, or at `path` with a numeric suffix if it
    /// is taken. Returns the path actually written.
    fn write_unique(&self, path: &Path, contents: &str) -> Result<PathBuf, ReviewError>;
}

/// `ArtifactStore` backed by the working tree.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn abs(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &Path) -> bool {
        self.abs(path).exists()
    }

    fn read(&self, path: &Path) -> Result<String, ReviewError> {
        let abs = self.abs(path);
        fs::read_to_string(&abs).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ReviewError::ArtifactNotFound {
                path: path.to_path_buf(),
            },
            _ => ReviewError::io(abs, e),
        })
    }

    fn relocate(&self, from: &Path, to: &Path) -> Result<(), ReviewError> {
        let src = self.abs(from);
        let dst = self.abs(to);
        if !src.exists() {
            return Err(ReviewError::ArtifactNotFound {
                path: from.to_path_buf(),
            });
        }
        if dst.exists() {
            return Err(ReviewError::io(
                &dst,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "refusing to overwrite existing artifact",
                ),
            ));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| ReviewError::io(parent, e))?;
        }
        fs::rename(&src, &dst).map_err(|e| ReviewError::io(&dst, e))
    }

    fn write_unique(&self, path: &Path, contents: &str) -> Result<PathBuf, ReviewError> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(|e| ReviewError::io(parent, e))?;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        for attempt in 1u32.. {
            let candidate = if attempt == 1 {
                path.to_path_buf()
            } else {
                path.with_file_name(format!("{}-{}{}", stem, attempt, ext))
            };
            let target = self.abs(&candidate);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
            {
                Ok(mut file) => {
                    file.write_all(contents.as_bytes())
                        .map_err(|e| ReviewError::io(&target, e))?;
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ReviewError::io(&target, e)),
            }
        }
        Err(ReviewError::io(
            abs,
            std::io::Error::other("no free file name for record"),
        ))
    }
}
