//! Per-project SVN mirror.
//!
//! The mirror is checked out once at startup and kept current by a timer.
//! Compound operations take an exclusive [`SvnSession`] for the whole of
//! sync-then-commit; log queries share the lock with each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipwright_common::{ProcessRunner, SvnLogEntry, SvnPath};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ProjectConfig, SvnConfig};
use crate::errors::SvnError;

#[async_trait]
pub trait SvnClient: Send + Sync {
    async fn checkout(&self) -> Result<(), SvnError>;
    async fn update(&self) -> Result<(), SvnError>;
    async fn commit(&self, message: &str) -> Result<(), SvnError>;
    async fn log(&self, count: usize) -> Result<Vec<SvnLogEntry>, SvnError>;
}

// ── Script-backed client ─────────────────────────────────────────────

/// Drives `svn.sh <work_dir> <command> <username> <password> <remote_dir> [arg]`.
pub struct ScriptSvnClient {
    project: String,
    script: PathBuf,
    work_dir: PathBuf,
    settings: SvnConfig,
    runner: Arc<dyn ProcessRunner>,
}

impl ScriptSvnClient {
    pub fn new(project: &ProjectConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            project: project.project_name.clone(),
            script: project.svn_script(),
            work_dir: project.svn.work_dir.clone(),
            settings: project.svn.clone(),
            runner,
        }
    }

    async fn run(&self, step: &'static str, extra: Option<&str>) -> Result<Vec<u8>, SvnError> {
        let mut args = vec![
            step.to_string(),
            self.settings.username.clone(),
            self.settings.password.clone(),
            self.settings.remote_dir.clone(),
        ];
        if let Some(extra) = extra {
            args.push(extra.to_string());
        }

        self.runner
            .execute(&self.script, &self.work_dir, &args)
            .await
            .map_err(|source| SvnError::Step {
                project: self.project.clone(),
                step,
                source,
            })
    }
}

#[async_trait]
impl SvnClient for ScriptSvnClient {
    async fn checkout(&self) -> Result<(), SvnError> {
        let url = self.settings.repository_url();
        self.run("checkout", Some(&url)).await.map(|_| ())
    }

    async fn update(&self) -> Result<(), SvnError> {
        self.run("update", None).await.map(|_| ())
    }

    async fn commit(&self, message: &str) -> Result<(), SvnError> {
        self.run("commit", Some(message)).await.map(|_| ())
    }

    async fn log(&self, count: usize) -> Result<Vec<SvnLogEntry>, SvnError> {
        let raw = self.run("log", Some(&count.to_string())).await?;
        let xml = String::from_utf8_lossy(&raw);
        parse_svn_log(&xml).map_err(|source| SvnError::LogParse {
            project: self.project.clone(),
            source,
        })
    }
}

/// Parse `svn log --xml --verbose` output.
pub fn parse_svn_log(xml: &str) -> Result<Vec<SvnLogEntry>, roxmltree::Error> {
    let doc = roxmltree::Document::parse(xml)?;
    let entries = doc
        .descendants()
        .filter(|n| n.has_tag_name("logentry"))
        .map(|entry| {
            let text_of = |tag: &str| {
                entry
                    .children()
                    .find(|c| c.has_tag_name(tag))
                    .and_then(|c| c.text())
                    .unwrap_or_default()
                    .to_string()
            };

            let date = entry
                .children()
                .find(|c| c.has_tag_name("date"))
                .and_then(|c| c.text())
                .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
                .map(|d| d.with_timezone(&Utc));

            let paths = entry
                .descendants()
                .filter(|n| n.has_tag_name("path"))
                .map(|p| SvnPath {
                    action: p.attribute("action").unwrap_or_default().to_string(),
                    prop_mods: p.attribute("prop-mods").unwrap_or_default().to_string(),
                    text_mods: p.attribute("text-mods").unwrap_or_default().to_string(),
                    kind: p.attribute("kind").unwrap_or_default().to_string(),
                    path: p.text().unwrap_or_default().trim().to_string(),
                })
                .collect();

            SvnLogEntry {
                revision: entry.attribute("revision").unwrap_or_default().to_string(),
                author: text_of("author"),
                date,
                message: text_of("msg"),
                paths,
            }
        })
        .collect();
    Ok(entries)
}

// ── Operator ─────────────────────────────────────────────────────────

pub struct SvnOperator {
    project: String,
    client: Arc<dyn SvnClient>,
    lock: RwLock<()>,
    update_interval: Duration,
}

/// Exclusive hold on a project's SVN mirror.
pub struct SvnSession<'a> {
    operator: &'a SvnOperator,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl SvnSession<'_> {
    pub async fn commit(&self, message: &str) -> Result<(), SvnError> {
        self.operator.client.commit(message).await?;
        tracing::info!(project = %self.operator.project, "svn commit finished");
        Ok(())
    }
}

impl SvnOperator {
    pub fn new(project: impl Into<String>, client: Arc<dyn SvnClient>, update_interval: Duration) -> Self {
        Self {
            project: project.into(),
            client,
            lock: RwLock::new(()),
            update_interval,
        }
    }

    pub async fn lock(&self) -> SvnSession<'_> {
        SvnSession {
            operator: self,
            _guard: self.lock.write().await,
        }
    }

    pub async fn log(&self, count: usize) -> Result<Vec<SvnLogEntry>, SvnError> {
        let _shared = self.lock.read().await;
        self.client.log(count).await
    }

    pub async fn update(&self) -> Result<(), SvnError> {
        let _exclusive = self.lock.write().await;
        self.client.update().await
    }

    /// Check out the mirror, then update it every interval until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let operator = Arc::clone(self);
        tokio::spawn(async move {
            {
                let _exclusive = operator.lock.write().await;
                if let Err(e) = operator.client.checkout().await {
                    tracing::warn!(project = %operator.project, error = %e, "svn checkout failed");
                }
            }

            let period = operator.update_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = operator.update().await {
                            tracing::warn!(project = %operator.project, error = %e, "svn update failed");
                        }
                    }
                }
            }
            tracing::info!(project = %operator.project, "svn update timer stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const LOG_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<log>
<logentry revision="1042">
<author>builder</author>
<date>2020-03-13T08:15:30.123456Z</date>
<paths>
<path action="M" prop-mods="false" text-mods="true" kind="file">/helix/trunk/server/main.lua</path>
<path action="A" kind="dir">/helix/trunk/assets</path>
</paths>
<msg>release 1.2</msg>
</logentry>
<logentry revision="1041">
<author>ops</author>
<date>2020-03-12T23:00:00.000000Z</date>
<msg></msg>
</logentry>
</log>"#;

    #[derive(Default)]
    pub(crate) struct FakeSvn {
        pub calls: StdMutex<Vec<String>>,
    }

    impl FakeSvn {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SvnClient for FakeSvn {
        async fn checkout(&self) -> Result<(), SvnError> {
            self.calls.lock().unwrap().push("checkout".into());
            Ok(())
        }

        async fn update(&self) -> Result<(), SvnError> {
            self.calls.lock().unwrap().push("update".into());
            Ok(())
        }

        async fn commit(&self, message: &str) -> Result<(), SvnError> {
            self.calls.lock().unwrap().push(format!("commit:{}", message));
            Ok(())
        }

        async fn log(&self, count: usize) -> Result<Vec<SvnLogEntry>, SvnError> {
            self.calls.lock().unwrap().push(format!("log:{}", count));
            Ok(Vec::new())
        }
    }

    #[test]
    fn parses_log_entries_and_paths() {
        let entries = parse_svn_log(LOG_XML).unwrap();
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.revision, "1042");
        assert_eq!(first.author, "builder");
        assert_eq!(first.message, "release 1.2");
        assert_eq!(
            first.date.map(|d| d.to_rfc3339()),
            Some("2020-03-13T08:15:30.123456+00:00".to_string())
        );
        assert_eq!(first.paths.len(), 2);
        assert_eq!(first.paths[0].action, "M");
        assert_eq!(first.paths[0].text_mods, "true");
        assert_eq!(first.paths[0].path, "/helix/trunk/server/main.lua");
        assert_eq!(first.paths[1].kind, "dir");

        assert!(entries[1].message.is_empty());
        assert!(entries[1].paths.is_empty());
    }

    #[test]
    fn malformed_log_is_an_error() {
        assert!(parse_svn_log("<log><logentry>").is_err());
    }

    #[tokio::test]
    async fn session_commits_through_client() {
        let fake = Arc::new(FakeSvn::default());
        let svn = SvnOperator::new("helix", fake.clone(), Duration::from_secs(3600));

        let session = svn.lock().await;
        session.commit("release 1.2").await.unwrap();
        drop(session);

        svn.log(5).await.unwrap();
        assert_eq!(fake.calls(), vec!["commit:release 1.2", "log:5"]);
    }

    #[tokio::test]
    async fn timer_checks_out_then_updates() {
        let fake = Arc::new(FakeSvn::default());
        let svn = Arc::new(SvnOperator::new("helix", fake.clone(), Duration::from_millis(20)));
        let cancel = CancellationToken::new();

        let handle = svn.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls[0], "checkout");
        assert!(calls[1..].iter().all(|c| c == "update"));
        assert!(calls.len() >= 2);
    }
}
