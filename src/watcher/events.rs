//! Remote change notifications

use serde::{Deserialize, Serialize};

/// Git subcommands that can rewrite arbitrary parts of the tree
const WHOLESALE_GIT_OPS: &[&str] = &[
    "checkout", "switch", "merge", "rebase", "pull", "reset", "stash", "clone",
];

/// Kind of a per-path change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// A single remote file system change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    /// Previous location, renames only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

impl ChangeEvent {
    pub fn created(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Created)
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }

    pub fn renamed(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            old_path: Some(old_path.into()),
            ..Self::new(new_path, ChangeKind::Renamed)
        }
    }

    fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            old_path: None,
        }
    }
}

/// A version control operation reported by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOperation {
    /// Subcommand, e.g. `commit` or `git checkout main`
    pub op: String,
    /// Paths the operation touched, if the remote knows them
    pub paths: Option<Vec<String>>,
}

impl GitOperation {
    pub fn new(op: impl Into<String>, paths: Option<Vec<String>>) -> Self {
        Self {
            op: op.into(),
            paths,
        }
    }

    /// Subcommand name, lowercased, without a leading `git`
    pub fn subcommand(&self) -> String {
        self.op
            .split_whitespace()
            .find(|word| !word.eq_ignore_ascii_case("git"))
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /// Whether the blast radius is unbounded and the whole cache must go
    pub fn requires_clear(&self) -> bool {
        match &self.paths {
            None => true,
            Some(paths) if paths.is_empty() => true,
            Some(_) => WHOLESALE_GIT_OPS.contains(&self.subcommand().as_str()),
        }
    }
}

/// Everything a remote change stream can deliver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteEvent {
    Change(ChangeEvent),
    GitOperation {
        op: String,
        #[serde(default)]
        paths: Option<Vec<String>>,
    },
    PackageOperation {
        op: String,
    },
    StreamInterrupted,
    Reconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_classification() {
        let commit = GitOperation::new("commit", Some(vec!["/src/lib.rs".into()]));
        assert!(!commit.requires_clear());

        let checkout = GitOperation::new("git checkout main", Some(vec!["/src".into()]));
        assert_eq!(checkout.subcommand(), "checkout");
        assert!(checkout.requires_clear());

        assert!(GitOperation::new("commit", None).requires_clear());
        assert!(GitOperation::new("add", Some(Vec::new())).requires_clear());
        assert!(GitOperation::new("Rebase", Some(vec!["/a".into()])).requires_clear());
    }

    #[test]
    fn test_remote_event_json() {
        let event: RemoteEvent = serde_json::from_str(
            r#"{"type":"change","path":"/b","kind":"renamed","oldPath":"/a"}"#,
        )
        .unwrap();
        assert_eq!(event, RemoteEvent::Change(ChangeEvent::renamed("/a", "/b")));

        let event: RemoteEvent =
            serde_json::from_str(r#"{"type":"gitOperation","op":"pull"}"#).unwrap();
        assert_eq!(
            event,
            RemoteEvent::GitOperation {
                op: "pull".into(),
                paths: None
            }
        );

        let event: RemoteEvent = serde_json::from_str(r#"{"type":"reconnected"}"#).unwrap();
        assert_eq!(event, RemoteEvent::Reconnected);
    }
}
