use anyhow::{Context, Result};
use git2::{
    Delta, DiffOptions, Index, IndexAddOption, IndexEntry, IndexTime, Oid, Patch, Repository,
    Signature, Sort,
};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
            ChangeType::Renamed => "renamed",
        }
    }
}

/// One changed file in a tree-to-workdir diff.
#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub path: PathBuf,
    pub change_type: ChangeType,
    /// Line numbers of added lines, new-file side
    pub added_lines: Vec<u32>,
    /// Line numbers of removed lines, old-file side
    pub removed_lines: Vec<u32>,
    /// Unified diff, cut after the configured number of lines
    pub excerpt: String,
    pub truncated: bool,
}

/// A commit found by message search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub summary: String,
}

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(repo_root: &Path) -> Result<Self> {
        let repo = Repository::open(repo_root).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Number of commits reachable from HEAD.
    pub fn commit_count(&self) -> Result<usize> {
        let mut walk = self.repo.revwalk()?;
        if walk.push_head().is_err() {
            return Ok(0);
        }
        Ok(walk.count())
    }

    /// Walk back from HEAD and return the most recent commit whose message
    /// matches `pattern`.
    pub fn find_commit_matching(&self, pattern: &Regex) -> Result<Option<CommitInfo>> {
        let mut walk = self.repo.revwalk()?;
        if walk.push_head().is_err() {
            return Ok(None);
        }
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            let message = commit.message().unwrap_or("");
            if pattern.is_match(message) {
                return Ok(Some(CommitInfo {
                    sha: commit.id().to_string(),
                    summary: commit.summary().unwrap_or("").to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// Commit exactly `paths` (root-relative) on top of HEAD.
    ///
    /// Paths that exist in the working tree are committed with their current
    /// content; paths that no longer exist are committed as removals. The
    /// commit tree is built in memory from HEAD, so nothing else staged in the
    /// repository index goes into the commit. Afterwards only `paths` are
    /// refreshed in the shared index; other staged entries are left alone.
    pub fn commit_paths(
        &self,
        message: &str,
        paths: &[PathBuf],
        author_name: &str,
        author_email: &str,
    ) -> Result<String> {
        let workdir = self
            .repo
            .workdir()
            .context("Repository has no working directory")?
            .to_path_buf();
        let parent = self.get_head_commit();

        let mut tree_index = Index::new()?;
        if let Some(ref commit) = parent {
            tree_index.read_tree(&commit.tree()?)?;
        }

        for path in paths {
            let full = workdir.join(path);
            if full.is_file() {
                let entry = self
                    .blob_entry(path, &full)
                    .with_context(|| format!("Failed to stage {}", path.display()))?;
                tree_index.add(&entry)?;
            } else if tree_index.get_path(path, 0).is_some() {
                tree_index
                    .remove(path, 0)
                    .with_context(|| format!("Failed to stage removal of {}", path.display()))?;
            }
        }

        let tree_id = tree_index.write_tree_to(&self.repo)?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now(author_name, author_email)?;

        // Handle unborn branch (new repo with no commits yet)
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("Failed to create commit")?;

        self.refresh_index(&workdir, paths)?;
        Ok(commit_id.to_string())
    }

    /// Write `full` as a blob and describe it as an index entry at `path`.
    fn blob_entry(&self, path: &Path, full: &Path) -> Result<IndexEntry> {
        use std::os::unix::fs::PermissionsExt;

        let content = std::fs::read(full)?;
        let executable = std::fs::metadata(full)?.permissions().mode() & 0o111 != 0;
        let id = self.repo.blob(&content)?;
        let rel = path
            .to_str()
            .with_context(|| format!("Non UTF-8 path {}", path.display()))?;
        Ok(IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: if executable { 0o100755 } else { 0o100644 },
            uid: 0,
            gid: 0,
            file_size: content.len() as u32,
            id,
            flags: 0,
            flags_extended: 0,
            path: rel.as_bytes().to_vec(),
        })
    }

    /// Bring the named paths of the on-disk index in line with the working tree.
    fn refresh_index(&self, workdir: &Path, paths: &[PathBuf]) -> Result<()> {
        let mut index = self.repo.index()?;
        for path in paths {
            if workdir.join(path).is_file() {
                index.add_path(path)?;
            } else if index.get_path(path, 0).is_some() {
                index.remove_path(path)?;
            }
        }
        index.write()?;
        Ok(())
    }

    /// Paths touched by the commit `sha` relative to its first parent.
    pub fn paths_changed_in(&self, sha: &str) -> Result<Vec<PathBuf>> {
        let commit = self.repo.find_commit(Oid::from_str(sha)?)?;
        let parent_tree = match commit.parents().next() {
            Some(parent) => Some(parent.tree()?),
            None => None,
        };
        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&commit.tree()?), None)?;
        Ok(diff
            .deltas()
            .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
            .map(Path::to_path_buf)
            .collect())
    }

    /// Stage everything and commit. Used to establish fixtures and baselines.
    pub fn commit_all(&self, message: &str, author_name: &str, author_email: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now(author_name, author_email)?;
        let parent = self.get_head_commit();
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(commit_id.to_string())
    }

    /// Files under `dir` that differ between `base_sha` and the working tree
    /// (index and untracked files included).
    pub fn diff_dir_since(&self, base_sha: &str, dir: &Path, excerpt_lines: usize) -> Result<Vec<FileDiff>> {
        let base_oid = Oid::from_str(base_sha)?;
        let base_tree = self.repo.find_commit(base_oid)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true)
            .pathspec(dir);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;

        let mut file_diffs = Vec::new();

        for delta_idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(delta_idx) else {
                continue;
            };
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_path_buf();

            let change_type = match delta.status() {
                Delta::Added | Delta::Untracked => ChangeType::Added,
                Delta::Modified | Delta::Typechange => ChangeType::Modified,
                Delta::Deleted => ChangeType::Deleted,
                Delta::Renamed => ChangeType::Renamed,
                _ => continue,
            };

            let mut file_diff = FileDiff {
                path,
                change_type,
                added_lines: Vec::new(),
                removed_lines: Vec::new(),
                excerpt: String::new(),
                truncated: false,
            };

            if let Ok(Some(patch)) = Patch::from_diff(&diff, delta_idx) {
                collect_patch(&patch, excerpt_lines, &mut file_diff)?;
            }

            file_diffs.push(file_diff);
        }

        Ok(file_diffs)
    }
}

fn collect_patch(patch: &Patch<'_>, excerpt_lines: usize, out: &mut FileDiff) -> Result<()> {
    let mut excerpt: Vec<String> = Vec::new();
    let mut dropped = 0usize;
    let mut push = |line: String, excerpt: &mut Vec<String>| {
        if excerpt.len() < excerpt_lines {
            excerpt.push(line);
        } else {
            dropped += 1;
        }
    };

    for hunk_idx in 0..patch.num_hunks() {
        let (hunk, _) = patch.hunk(hunk_idx)?;
        push(
            String::from_utf8_lossy(hunk.header()).trim_end().to_string(),
            &mut excerpt,
        );
        for line_idx in 0..patch.num_lines_in_hunk(hunk_idx)? {
            let line = patch.line_in_hunk(hunk_idx, line_idx)?;
            let origin = line.origin();
            match origin {
                '+' => out.added_lines.extend(line.new_lineno()),
                '-' => out.removed_lines.extend(line.old_lineno()),
                _ => {}
            }
            if matches!(origin, '+' | '-' | ' ') {
                let content = String::from_utf8_lossy(line.content());
                push(format!("{}{}", origin, content.trim_end_matches('\n')), &mut excerpt);
            }
        }
    }

    out.truncated = dropped > 0;
    out.excerpt = excerpt.join("\n");
    if out.truncated {
        out.excerpt.push_str(&format!("\n... ({} more lines)", dropped));
    }
    Ok(())
}
