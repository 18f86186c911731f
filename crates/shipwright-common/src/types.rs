use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Branches ─────────────────────────────────────────────────────────

/// A remote branch as last seen by a project's refresh step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub active: bool,
    /// Operator-assigned SVN tag used when syncing this branch into SVN.
    pub release_tag: Option<String>,
}

impl Branch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: false,
            release_tag: None,
        }
    }

    /// The tag to sync with, if one has been assigned and is non-empty.
    pub fn usable_release_tag(&self) -> Option<&str> {
        self.release_tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Point-in-time view of one project's git state, as served over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    pub name: String,
    pub branches: Vec<Branch>,
    pub task_count: i64,
    pub current_task: String,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "gitGen")]
    GitGenerate,
    #[serde(rename = "svnCommit")]
    SvnCommit,
    #[serde(rename = "ftpUpload")]
    FtpUpload,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitGenerate => "gitGen",
            Self::SvnCommit => "svnCommit",
            Self::FtpUpload => "ftpUpload",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gitGen" => Ok(Self::GitGenerate),
            "svnCommit" => Ok(Self::SvnCommit),
            "ftpUpload" => Ok(Self::FtpUpload),
            _ => Err(format!("Invalid command kind: {}", s)),
        }
    }
}

/// Archive flavour produced by the compress script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ZipType {
    /// Full server package.
    #[default]
    #[serde(rename = "ser")]
    Full,
    /// Incremental patch package.
    #[serde(rename = "pat")]
    Patch,
}

impl ZipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "ser",
            Self::Patch => "pat",
        }
    }
}

impl FromStr for ZipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ser" => Ok(Self::Full),
            "pat" => Ok(Self::Patch),
            _ => Err(format!("Invalid zip type: {}", s)),
        }
    }
}

/// A unit of work a client asks a project to perform asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub project_name: String,
    pub branch_name: String,
    #[serde(rename = "command")]
    pub kind: CommandKind,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub zip_type: ZipType,
    #[serde(default)]
    pub zip_flags: String,
}

impl Command {
    pub fn new(
        project_name: impl Into<String>,
        branch_name: impl Into<String>,
        kind: CommandKind,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            branch_name: branch_name.into(),
            kind,
            message: String::new(),
            zip_type: ZipType::default(),
            zip_flags: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_zip(mut self, zip_type: ZipType, zip_flags: impl Into<String>) -> Self {
        self.zip_type = zip_type;
        self.zip_flags = zip_flags.into();
        self
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Waiting,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether moving from `self` to `next` keeps the status sequence
    /// a subsequence of Waiting, Processing, then one terminal state.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Processing)
                | (Self::Waiting, Self::Error)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Error)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an asynchronous task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub status: TaskStatus,
    pub messages: Vec<String>,
    pub command: Command,
}

// ── SVN ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SvnPath {
    pub action: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub prop_mods: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text_mods: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SvnLogEntry {
    pub revision: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub message: String,
    pub paths: Vec<SvnPath>,
}

// ── FTP ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtpEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

// ── Notices ──────────────────────────────────────────────────────────

/// Release notice shown on an environment's landing page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NoticeContent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub content: String,
}
