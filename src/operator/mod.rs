//! Per-project collaborators, one per external system.

pub mod ftp;
pub mod git;
pub mod notice;
pub mod svn;

pub use ftp::{ArtifactNames, CurlFtpClient, FtpClient, FtpOperator};
pub use git::{BranchRegistry, GitCommand, GitOperator, GitOptions, Worktree};
pub use notice::{HttpNoticeStore, NoticeOperator, NoticeStore};
pub use svn::{ScriptSvnClient, SvnClient, SvnOperator, SvnSession};
