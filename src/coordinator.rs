//! Project coordinator.
//!
//! Owns every configured [`Project`] and is the only thing the HTTP layer
//! talks to. Compound operations take their locks in one global order:
//!
//! ```text
//! git working copy ──► svn session ──► git branch registry
//! ```
//!
//! - **SvnCommit**: working copy, then svn session; sync the branch at its
//!   release tag into the mirror, commit, release.
//! - **FtpUpload**: working copy, then registry (read); allocate the day's
//!   next version, checkout + compress, upload introduction, archive and
//!   checksum in that order, revert the working copy.
//! - **Submit**: record a task and hand it to the project's worker.
//!
//! Holding the working copy for the whole of FtpUpload also serializes
//! compress requests of one project, so two uploads never allocate the same
//! version.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use shipwright_common::{
    Command, CommandKind, FtpEntry, GitInfo, NoticeContent, ProcessRunner, ShellRunner,
    SvnLogEntry, Task, ZipType,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ProjectConfig, RuntimeConfig};
use crate::errors::CoordinatorError;
use crate::operator::{
    ArtifactNames, BranchRegistry, CurlFtpClient, FtpOperator, GitOperator, GitOptions,
    HttpNoticeStore, NoticeOperator, ScriptSvnClient, SvnOperator, Worktree,
};
use crate::tasks::{TaskDispatcher, TaskHub, Worker};

/// One configured project and its collaborators.
pub struct Project {
    name: String,
    artifact_prefix: String,
    git: Arc<GitOperator>,
    svn: Arc<SvnOperator>,
    ftp: FtpOperator,
    notice: NoticeOperator,
    hub: Arc<TaskHub>,
    worker: Arc<Worker>,
}

impl Project {
    pub fn new(
        git: GitOperator,
        svn: SvnOperator,
        ftp: FtpOperator,
        notice: NoticeOperator,
        artifact_prefix: impl Into<String>,
        worker_capacity: usize,
    ) -> Self {
        let name = git.project().to_string();
        let hub = Arc::new(TaskHub::new(name.clone()));
        let worker = Arc::new(Worker::new(name.clone(), Arc::clone(&hub), worker_capacity));
        Self {
            name,
            artifact_prefix: artifact_prefix.into(),
            git: Arc::new(git),
            svn: Arc::new(svn),
            ftp,
            notice,
            hub,
            worker,
        }
    }

    /// Wire a project to the real script, FTP and object storage clients.
    pub fn from_config(
        config: &ProjectConfig,
        runtime: &RuntimeConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let name = config.project_name.clone();
        let git = GitOperator::new(
            name.clone(),
            config.git_script(),
            config.git.work_dir.clone(),
            Arc::clone(&runner),
            GitOptions::from(runtime),
        );
        let svn = SvnOperator::new(
            name.clone(),
            Arc::new(ScriptSvnClient::new(config, runner)),
            runtime.svn_update_interval(),
        );
        let ftp = FtpOperator::new(name.clone(), Arc::new(CurlFtpClient::new(config.ftp.clone())));
        let notice = NoticeOperator::new(
            name,
            config.oss.clone(),
            Arc::new(HttpNoticeStore::new(&config.oss)),
        );
        Self::new(
            git,
            svn,
            ftp,
            notice,
            config.ftp.artifact_prefix.clone(),
            runtime.worker_capacity,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn git(&self) -> &Arc<GitOperator> {
        &self.git
    }
}

pub struct Coordinator {
    projects: HashMap<String, Project>,
}

impl Coordinator {
    pub fn new(projects: Vec<Project>) -> Self {
        let projects = projects
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Self { projects }
    }

    pub fn from_config(config: &Config) -> Self {
        let runner: Arc<dyn ProcessRunner> = Arc::new(ShellRunner::new());
        Self::new(
            config
                .projects
                .iter()
                .map(|p| Project::from_config(p, &config.runtime, Arc::clone(&runner)))
                .collect(),
        )
    }

    pub fn project_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.projects.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Spawn every project's git loop, svn update timer and worker.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let dispatcher: Arc<dyn TaskDispatcher> = Arc::clone(self) as Arc<dyn TaskDispatcher>;
        let mut handles = Vec::new();

        for name in self.project_names() {
            let project = &self.projects[name];
            if let Some(handle) = project.git.start(cancel.clone()).await {
                handles.push(handle);
            }
            handles.push(project.svn.start(cancel.clone()));
            if let Some(handle) = project
                .worker
                .start(Arc::clone(&dispatcher), cancel.clone())
                .await
            {
                handles.push(handle);
            }
            tracing::info!(project = %name, "project started");
        }
        handles
    }

    fn project(&self, name: &str) -> Result<&Project, CoordinatorError> {
        self.projects
            .get(name)
            .ok_or_else(|| CoordinatorError::ProjectNotFound {
                name: name.to_string(),
            })
    }

    // ── Git ──────────────────────────────────────────────────────────

    pub async fn git_info(&self, project: &str) -> Result<GitInfo, CoordinatorError> {
        Ok(self.project(project)?.git.info().await)
    }

    pub async fn all_git_info(&self) -> Vec<GitInfo> {
        let mut infos = Vec::with_capacity(self.projects.len());
        for name in self.project_names() {
            infos.push(self.projects[name].git.info().await);
        }
        infos
    }

    pub async fn git_generate(&self, project: &str, branch: &str) -> Result<(), CoordinatorError> {
        self.project(project)?.git.generate(branch).await?;
        Ok(())
    }

    pub async fn refresh(&self, project: &str) -> Result<(), CoordinatorError> {
        self.project(project)?.git.request_refresh().await?;
        Ok(())
    }

    pub async fn set_release_tag(
        &self,
        project: &str,
        branch: &str,
        tag: &str,
    ) -> Result<(), CoordinatorError> {
        self.project(project)?.git.set_release_tag(branch, tag).await?;
        Ok(())
    }

    // ── SVN ──────────────────────────────────────────────────────────

    /// Sync `branch` into the SVN mirror at its release tag and commit it.
    pub async fn svn_commit(
        &self,
        project: &str,
        branch: &str,
        message: &str,
    ) -> Result<(), CoordinatorError> {
        let p = self.project(project)?;
        let worktree = p.git.lock_worktree().await;
        let session = p.svn.lock().await;

        let tag = p.git.sync_to_tag(&worktree, branch).await?;
        session.commit(message).await?;
        tracing::info!(project = %project, branch = %branch, tag = %tag, "branch committed to svn");
        Ok(())
    }

    pub async fn svn_log(&self, project: &str, count: usize) -> Result<Vec<SvnLogEntry>, CoordinatorError> {
        Ok(self.project(project)?.svn.log(count).await?)
    }

    // ── FTP ──────────────────────────────────────────────────────────

    pub async fn ftp_list(
        &self,
        project: &str,
        filter: Option<&str>,
    ) -> Result<Vec<FtpEntry>, CoordinatorError> {
        Ok(self.project(project)?.ftp.list(filter).await?)
    }

    pub async fn ftp_read(&self, project: &str, name: &str) -> Result<Vec<u8>, CoordinatorError> {
        Ok(self.project(project)?.ftp.read(name).await?)
    }

    pub async fn ftp_write(&self, project: &str, name: &str, data: &[u8]) -> Result<(), CoordinatorError> {
        self.project(project)?.ftp.write(name, data).await?;
        Ok(())
    }

    /// Build and upload today's next release of `branch`.
    pub async fn ftp_compress(
        &self,
        project: &str,
        branch: &str,
        zip_type: ZipType,
        zip_flags: &str,
    ) -> Result<ArtifactNames, CoordinatorError> {
        self.ftp_compress_on(project, branch, zip_type, zip_flags, Local::now().date_naive())
            .await
    }

    /// [`Self::ftp_compress`] with the release date supplied by the caller.
    pub async fn ftp_compress_on(
        &self,
        project: &str,
        branch: &str,
        zip_type: ZipType,
        zip_flags: &str,
        date: NaiveDate,
    ) -> Result<ArtifactNames, CoordinatorError> {
        let p = self.project(project)?;
        let worktree = p.git.lock_worktree().await;
        let registry = p.git.read_registry().await;

        let result = compress_and_upload(p, &worktree, &registry, branch, zip_type, zip_flags, date).await;
        p.git.revert(&worktree).await;
        result
    }

    // ── Notices ──────────────────────────────────────────────────────

    pub fn notice_envs(&self, project: &str) -> Result<BTreeMap<String, String>, CoordinatorError> {
        Ok(self.project(project)?.notice.envs())
    }

    pub async fn notice_content(&self, project: &str, env: &str) -> Result<NoticeContent, CoordinatorError> {
        Ok(self.project(project)?.notice.content(env).await?)
    }

    pub async fn put_notice_content(
        &self,
        project: &str,
        env: &str,
        content: &NoticeContent,
    ) -> Result<(), CoordinatorError> {
        self.project(project)?.notice.put_content(env, content).await?;
        Ok(())
    }

    // ── Tasks ────────────────────────────────────────────────────────

    /// Record `command` as a task and queue it. Returns the task id at once;
    /// the command is attempted at most once.
    pub async fn submit(&self, command: Command) -> Result<u64, CoordinatorError> {
        let p = self.project(&command.project_name)?;
        let id = p.hub.create(command).await;
        p.worker.add(id).await?;
        Ok(id)
    }

    pub async fn tasks(&self, project: &str) -> Result<BTreeMap<u64, Task>, CoordinatorError> {
        Ok(self.project(project)?.hub.all().await)
    }

    pub async fn task(&self, project: &str, id: u64) -> Result<Task, CoordinatorError> {
        self.project(project)?
            .hub
            .get(id)
            .await
            .ok_or_else(|| CoordinatorError::TaskNotFound {
                project: project.to_string(),
                id,
            })
    }
}

async fn compress_and_upload(
    p: &Project,
    worktree: &Worktree<'_>,
    registry: &BranchRegistry,
    branch: &str,
    zip_type: ZipType,
    zip_flags: &str,
    date: NaiveDate,
) -> Result<ArtifactNames, CoordinatorError> {
    let sequence = p.ftp.next_version(date).await?;
    let names = ArtifactNames::new(&p.artifact_prefix, date, &sequence, zip_type);
    tracing::info!(project = %p.name, branch = %branch, version = %names.version, "release version allocated");

    p.git
        .compress(worktree, registry, branch, zip_type, &names.version, zip_flags)
        .await?;

    for name in names.in_upload_order() {
        p.ftp.upload(&p.git.work_dir().join(name), name).await?;
    }
    Ok(names)
}

#[async_trait]
impl TaskDispatcher for Coordinator {
    async fn dispatch(&self, task_id: u64, command: &Command) -> Result<(), CoordinatorError> {
        let project = command.project_name.as_str();
        let branch = command.branch_name.as_str();

        match command.kind {
            CommandKind::GitGenerate => {
                self.project(project)?.git.generate_and_wait(branch).await?;
            }
            CommandKind::SvnCommit => {
                self.svn_commit(project, branch, &command.message).await?;
            }
            CommandKind::FtpUpload => {
                let names = self
                    .ftp_compress(project, branch, command.zip_type, &command.zip_flags)
                    .await?;
                self.project(project)?
                    .hub
                    .append_message(task_id, &format!("uploaded {}", names.archive))
                    .await;
            }
        }
        Ok(())
    }
}
