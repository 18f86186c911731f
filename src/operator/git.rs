//! Per-project git operator.
//!
//! One [`GitOperator`] owns a project's branch registry and its git working
//! copy. All mutating git work that originates from clients flows through a
//! single command loop task, so two generate requests for the same project
//! never interleave their checkouts:
//!
//! ```text
//!  send_command ──► bounded mpsc ──► command loop ──► git.sh <work_dir> <step> ...
//!                                      ▲
//!                  interval tick ──────┘ (refresh)
//! ```
//!
//! Locks, always taken in this order:
//!
//! | Lock        | Kind            | Protects                                   |
//! |-------------|-----------------|--------------------------------------------|
//! | worktree    | `Mutex<()>`     | files in the git working copy              |
//! | registry    | `RwLock`        | the branch list and release tags           |
//!
//! Refresh only takes the registry write lock to swap in the freshly parsed
//! listing; the external `fetch`/`showAll` steps run without it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use shipwright_common::{Branch, GitInfo, ProcessRunner, ZipType};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::errors::GitError;

const REMOTE_PREFIX: &str = "remotes/origin/";
const ACTIVE_MARKER: char = '*';
const NO_TASK: &str = "N/A";

/// Timing and capacity of one operator's command loop.
#[derive(Debug, Clone)]
pub struct GitOptions {
    pub refresh_interval: Duration,
    pub send_timeout: Duration,
    pub capacity: usize,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for GitOptions {
    fn from(rt: &RuntimeConfig) -> Self {
        Self {
            refresh_interval: rt.refresh_interval(),
            send_timeout: rt.send_timeout(),
            capacity: rt.command_capacity,
        }
    }
}

// ── Branch registry ──────────────────────────────────────────────────

/// Known remote branches of one project, in listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchRegistry {
    branches: Vec<Branch>,
}

impl BranchRegistry {
    /// Build a registry from `git branch -a` output, carrying release tags
    /// over from `previous` for branches that still exist.
    pub fn from_listing(listing: &str, previous: &BranchRegistry) -> Self {
        let (active, names) = parse_branch_listing(listing);
        let branches = names
            .into_iter()
            .map(|name| Branch {
                active: active.as_deref() == Some(name.as_str()),
                release_tag: previous.get(&name).and_then(|b| b.release_tag.clone()),
                name,
            })
            .collect();
        Self { branches }
    }

    pub fn get(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn active(&self) -> Option<&Branch> {
        self.branches.iter().find(|b| b.active)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    fn set_release_tag(&mut self, name: &str, tag: &str) -> bool {
        match self.branches.iter_mut().find(|b| b.name == name) {
            Some(branch) => {
                branch.release_tag = Some(tag.to_string());
                true
            }
            None => false,
        }
    }
}

/// Returns the checked-out branch name and the remote-tracking branch names.
///
/// Local-only references and symbolic refs (`HEAD -> origin/master`) are
/// dropped. Duplicate remote names keep their first position.
fn parse_branch_listing(listing: &str) -> (Option<String>, Vec<String>) {
    let mut active = None;
    let mut names: Vec<String> = Vec::new();

    for line in listing.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.contains("->") {
            continue;
        }

        let is_active = trimmed.starts_with(ACTIVE_MARKER);
        let reference = trimmed.trim_start_matches(ACTIVE_MARKER).trim();

        if is_active && active.is_none() {
            active = Some(
                reference
                    .strip_prefix(REMOTE_PREFIX)
                    .unwrap_or(reference)
                    .to_string(),
            );
        }

        if let Some(name) = reference.strip_prefix(REMOTE_PREFIX) {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    (active, names)
}

// ── Commands ─────────────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<(), GitError>>;

/// A request for the command loop.
#[derive(Debug)]
pub enum GitCommand {
    Refresh,
    Generate {
        branch: String,
        reply: Option<Reply>,
    },
}

impl GitCommand {
    pub fn generate(branch: impl Into<String>) -> Self {
        Self::Generate {
            branch: branch.into(),
            reply: None,
        }
    }

    fn label(&self, project: &str) -> String {
        match self {
            Self::Refresh => format!("{}-all-refresh", project),
            Self::Generate { branch, .. } => format!("{}-{}-generate", project, branch),
        }
    }
}

/// Proof that the caller holds the working-copy lock.
pub struct Worktree<'a> {
    _guard: MutexGuard<'a, ()>,
}

// ── Operator ─────────────────────────────────────────────────────────

pub struct GitOperator {
    project: String,
    script: PathBuf,
    work_dir: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    options: GitOptions,
    registry: RwLock<BranchRegistry>,
    worktree: Mutex<()>,
    pending: AtomicI64,
    current: Mutex<Option<String>>,
    tx: mpsc::Sender<GitCommand>,
    rx: Mutex<Option<mpsc::Receiver<GitCommand>>>,
}

impl GitOperator {
    pub fn new(
        project: impl Into<String>,
        script: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        runner: Arc<dyn ProcessRunner>,
        options: GitOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        Self {
            project: project.into(),
            script: script.into(),
            work_dir: work_dir.into(),
            runner,
            options,
            registry: RwLock::new(BranchRegistry::default()),
            worktree: Mutex::new(()),
            pending: AtomicI64::new(0),
            current: Mutex::new(None),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Number of commands accepted but not yet finished by the loop.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Spawn the command loop. Returns `None` if it was already started.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().await.take()?;
        let operator = Arc::clone(self);
        Some(tokio::spawn(async move { operator.run(rx, cancel).await }))
    }

    /// Enqueue a command, waiting up to the send timeout for channel room.
    pub async fn send_command(&self, command: GitCommand) -> Result<(), GitError> {
        let label = command.label(&self.project);
        self.pending.fetch_add(1, Ordering::SeqCst);

        match self.tx.send_timeout(command, self.options.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(project = %self.project, command = %label, "git command channel full");
                Err(GitError::Backpressure {
                    project: self.project.clone(),
                    command: label,
                    timeout: self.options.send_timeout,
                })
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(GitError::LoopStopped {
                    project: self.project.clone(),
                })
            }
        }
    }

    pub async fn generate(&self, branch: &str) -> Result<(), GitError> {
        self.send_command(GitCommand::generate(branch)).await
    }

    /// Enqueue a generate and wait for the loop to finish it.
    pub async fn generate_and_wait(&self, branch: &str) -> Result<(), GitError> {
        let (reply, done) = oneshot::channel();
        self.send_command(GitCommand::Generate {
            branch: branch.to_string(),
            reply: Some(reply),
        })
        .await?;

        done.await.unwrap_or_else(|_| {
            Err(GitError::LoopStopped {
                project: self.project.clone(),
            })
        })
    }

    pub async fn request_refresh(&self) -> Result<(), GitError> {
        self.send_command(GitCommand::Refresh).await
    }

    pub async fn set_release_tag(&self, branch: &str, tag: &str) -> Result<(), GitError> {
        let mut registry = self.registry.write().await;
        if !registry.set_release_tag(branch, tag) {
            return Err(self.branch_not_found(branch));
        }
        tracing::info!(project = %self.project, branch = %branch, tag = %tag, "release tag set");
        Ok(())
    }

    pub async fn branches(&self) -> Vec<Branch> {
        self.registry.read().await.branches().to_vec()
    }

    pub async fn info(&self) -> GitInfo {
        let branches = self.branches().await;
        let current_task = self
            .current
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| NO_TASK.to_string());
        GitInfo {
            name: self.project.clone(),
            branches,
            task_count: self.pending(),
            current_task,
        }
    }

    // ── Working-copy access for compound operations ──────────────────

    pub async fn lock_worktree(&self) -> Worktree<'_> {
        Worktree {
            _guard: self.worktree.lock().await,
        }
    }

    /// Hold the registry steady across a multi-step sequence.
    pub async fn read_registry(&self) -> RwLockReadGuard<'_, BranchRegistry> {
        self.registry.read().await
    }

    /// Check out `branch` and copy it into the SVN mirror at its release tag.
    ///
    /// Returns the tag used. Fails before touching the working copy when the
    /// branch is unknown or has no release tag.
    pub async fn sync_to_tag(&self, _worktree: &Worktree<'_>, branch: &str) -> Result<String, GitError> {
        let registry = self.registry.read().await;
        let tag = registry
            .get(branch)
            .ok_or_else(|| self.branch_not_found(branch))?
            .usable_release_tag()
            .ok_or_else(|| GitError::MissingReleaseTag {
                project: self.project.clone(),
                branch: branch.to_string(),
            })?
            .to_string();

        self.checkout(&registry, branch).await?;
        self.step("svnSync", &[branch, tag.as_str()]).await?;
        tracing::info!(project = %self.project, branch = %branch, tag = %tag, "branch synced to svn mirror");
        Ok(tag)
    }

    /// Check out `branch` and build the release archive for `version`.
    pub async fn compress(
        &self,
        _worktree: &Worktree<'_>,
        registry: &BranchRegistry,
        branch: &str,
        zip_type: ZipType,
        version: &str,
        zip_flags: &str,
    ) -> Result<(), GitError> {
        self.checkout(registry, branch).await?;
        self.step("compress", &[branch, zip_type.as_str(), version, zip_flags])
            .await?;
        Ok(())
    }

    /// Discard working-copy changes. Failures are logged, never returned.
    pub async fn revert(&self, _worktree: &Worktree<'_>) {
        self.revert_unlocked().await;
    }

    // ── Command loop ─────────────────────────────────────────────────

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<GitCommand>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(project = %self.project, "git command loop started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(project = %self.project, error = %e, "scheduled refresh failed");
                    }
                }

                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        rx.close();
        let mut dropped = 0usize;
        while let Ok(command) = rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            dropped += 1;
            if let GitCommand::Generate { reply: Some(reply), .. } = command {
                let _ = reply.send(Err(GitError::LoopStopped {
                    project: self.project.clone(),
                }));
            }
        }
        tracing::info!(project = %self.project, dropped, "git command loop stopped");
    }

    async fn handle(&self, command: GitCommand) {
        *self.current.lock().await = Some(command.label(&self.project));

        let reply = match command {
            GitCommand::Refresh => {
                if let Err(e) = self.refresh().await {
                    tracing::warn!(project = %self.project, error = %e, "refresh failed");
                }
                None
            }
            GitCommand::Generate { branch, reply } => {
                let result = self.run_generate(&branch).await;
                match &result {
                    Ok(()) => tracing::info!(project = %self.project, branch = %branch, "generate finished"),
                    Err(e) => tracing::error!(project = %self.project, branch = %branch, error = %e, "generate failed"),
                }
                reply.map(|reply| (reply, result))
            }
        };

        *self.current.lock().await = None;
        self.pending.fetch_sub(1, Ordering::SeqCst);

        if let Some((reply, result)) = reply {
            let _ = reply.send(result);
        }
    }

    /// Fetch and re-read the remote branch listing.
    pub async fn refresh(&self) -> Result<(), GitError> {
        self.step("fetch", &[]).await?;
        let listing = self.step("showAll", &[]).await?;
        let listing = String::from_utf8_lossy(&listing);

        let mut registry = self.registry.write().await;
        let next = BranchRegistry::from_listing(&listing, &registry);
        tracing::debug!(project = %self.project, branches = next.branches().len(), "branch registry refreshed");
        *registry = next;
        Ok(())
    }

    /// checkout → generate → commit → push, then always revert.
    async fn run_generate(&self, branch: &str) -> Result<(), GitError> {
        if let Err(e) = self.refresh().await {
            tracing::warn!(project = %self.project, error = %e, "refresh before generate failed, using last known branches");
        }

        let _worktree = self.worktree.lock().await;
        let registry = self.registry.read().await;

        let result = self.generate_steps(&registry, branch).await;
        self.revert_unlocked().await;
        result
    }

    async fn generate_steps(&self, registry: &BranchRegistry, branch: &str) -> Result<(), GitError> {
        self.checkout(registry, branch).await?;
        self.step("generate", &[branch]).await?;
        self.step("commit", &[branch]).await?;
        self.step("push", &[branch]).await?;
        Ok(())
    }

    async fn checkout(&self, registry: &BranchRegistry, branch: &str) -> Result<(), GitError> {
        if !registry.contains(branch) {
            return Err(self.branch_not_found(branch));
        }
        let remote = format!("remotes/origin/{}", branch);
        self.step("checkout", &[branch, remote.as_str()]).await?;
        Ok(())
    }

    async fn revert_unlocked(&self) {
        if let Err(e) = self.step("revert", &[]).await {
            tracing::warn!(project = %self.project, error = %e, "working copy revert failed");
        }
    }

    async fn step(&self, step: &'static str, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(step.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));

        tracing::debug!(project = %self.project, step, "running git step");
        self.runner
            .execute(&self.script, &self.work_dir, &argv)
            .await
            .map_err(|source| GitError::Step {
                project: self.project.clone(),
                step,
                source,
            })
    }

    fn branch_not_found(&self, branch: &str) -> GitError {
        GitError::BranchNotFound {
            project: self.project.clone(),
            branch: branch.to_string(),
        }
    }
}
