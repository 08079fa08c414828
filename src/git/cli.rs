use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{GitCommit, GitRepository, GitRevisionResolver};
use crate::config::RepositoryMapping;
use crate::error::{Error, Result};

/// stderr fragments git prints when an object or path is simply absent
const MISSING_MARKERS: &[&str] = &[
    "does not exist",
    "exists on disk, but not in",
    "unknown revision",
    "bad object",
    "bad revision",
    "invalid object name",
    "not a valid object name",
];

/// Resolver backed by the `git` command line
pub struct GitCli {
    git_path: PathBuf,
    repositories: Vec<RepositoryMapping>,
}

impl GitCli {
    pub fn new(git_path: impl Into<PathBuf>, repositories: Vec<RepositoryMapping>) -> Self {
        Self {
            git_path: git_path.into(),
            repositories,
        }
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<Output> {
        debug!(cwd = %cwd.display(), ?args, "Running git");

        let output = Command::new(&self.git_path)
            .arg("-C")
            .arg(cwd)
            .args(args)
            .output()
            .await?;

        Ok(output)
    }

    /// Work out the repository root and repo-relative path for an absolute file path
    async fn locate(&self, path: &Path) -> Result<(PathBuf, String)> {
        if let Some(repo) = self
            .repositories
            .iter()
            .filter(|r| path.starts_with(&r.path))
            .max_by_key(|r| r.path.components().count())
        {
            let relative = path.strip_prefix(&repo.path).unwrap_or(path);
            return Ok((repo.path.clone(), to_git_path(relative)));
        }

        // File may not exist at HEAD; ask git from the nearest existing ancestor
        let ancestor = path
            .ancestors()
            .skip(1)
            .find(|p| p.is_dir())
            .ok_or_else(|| Error::Git {
                command: "rev-parse".to_string(),
                stderr: format!("no existing directory above {}", path.display()),
            })?;

        let output = self.run(ancestor, &["rev-parse", "--show-toplevel"]).await?;
        if !output.status.success() {
            return Err(git_error("rev-parse", &output));
        }

        let root = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        let relative = path.strip_prefix(&root).map_err(|_| Error::Git {
            command: "rev-parse".to_string(),
            stderr: format!("{} is outside {}", path.display(), root.display()),
        })?;
        let relative = to_git_path(relative);

        Ok((root, relative))
    }
}

#[async_trait]
impl GitRevisionResolver for GitCli {
    async fn repository_by_id(&self, id: &str) -> Result<Option<GitRepository>> {
        let repo = self
            .repositories
            .iter()
            .find(|r| r.id == id)
            .filter(|r| r.path.is_dir())
            .map(|r| GitRepository {
                id: r.id.clone(),
                path: r.path.clone(),
            });

        Ok(repo)
    }

    async fn file_content_for_revision(&self, path: &Path, sha: &str) -> Result<Option<String>> {
        let (root, relative) = self.locate(path).await?;
        let object = format!("{}:{}", sha, relative);

        let output = self.run(&root, &["show", &object]).await?;
        if !output.status.success() {
            if is_missing(&output) {
                debug!(sha, path = %relative, "File absent at revision");
                return Ok(None);
            }
            return Err(git_error("show", &output));
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    async fn commit(&self, repo_path: &Path, sha: &str) -> Result<Option<GitCommit>> {
        let output = self
            .run(
                repo_path,
                &["log", "-1", "--format=%H%x00%an%x00%s", sha, "--"],
            )
            .await?;

        if !output.status.success() {
            if is_missing(&output) {
                return Ok(None);
            }
            return Err(git_error("log", &output));
        }

        Ok(parse_commit_line(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn fetch_all_remotes(&self, repo_path: &Path) -> Result<bool> {
        let output = self.run(repo_path, &["fetch", "--all"]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(repo = %repo_path.display(), stderr = %stderr.trim(), "git fetch --all failed");
            return Ok(false);
        }

        Ok(true)
    }
}

fn to_git_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_missing(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    MISSING_MARKERS.iter().any(|m| stderr.contains(m))
}

fn git_error(command: &str, output: &Output) -> Error {
    Error::Git {
        command: command.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn parse_commit_line(stdout: &str) -> Option<GitCommit> {
    let line = stdout.lines().next()?;
    let mut parts = line.splitn(3, '\0');
    let sha = parts.next().filter(|s| !s.is_empty())?;

    Some(GitCommit {
        sha: sha.to_string(),
        author: parts.next().unwrap_or_default().to_string(),
        message: parts.next().unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commit_line() {
        let commit = parse_commit_line("abc123\0Jane Doe\0Fix the thing\n").unwrap();
        assert_eq!(commit.sha, "abc123");
        assert_eq!(commit.author, "Jane Doe");
        assert_eq!(commit.message, "Fix the thing");

        assert!(parse_commit_line("").is_none());
    }

    #[test]
    fn test_to_git_path() {
        assert_eq!(to_git_path(Path::new("src/lib/a.rs")), "src/lib/a.rs");
    }

    #[tokio::test]
    async fn test_repository_by_id_requires_open_directory() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(
            "git",
            vec![
                RepositoryMapping {
                    id: "open".to_string(),
                    path: dir.path().to_path_buf(),
                },
                RepositoryMapping {
                    id: "gone".to_string(),
                    path: dir.path().join("missing"),
                },
            ],
        );

        let repo = git.repository_by_id("open").await.unwrap().unwrap();
        assert_eq!(repo.path, dir.path());
        assert!(git.repository_by_id("gone").await.unwrap().is_none());
        assert!(git.repository_by_id("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locate_uses_longest_mapping() {
        let git = GitCli::new(
            "git",
            vec![
                RepositoryMapping {
                    id: "outer".to_string(),
                    path: PathBuf::from("/work"),
                },
                RepositoryMapping {
                    id: "inner".to_string(),
                    path: PathBuf::from("/work/nested"),
                },
            ],
        );

        let (root, relative) = git.locate(Path::new("/work/nested/src/a.ts")).await.unwrap();
        assert_eq!(root, PathBuf::from("/work/nested"));
        assert_eq!(relative, "src/a.ts");
    }
}
