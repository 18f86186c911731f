//! Artifact drop on FTP.
//!
//! Release archives are named after a daily version: `yyyymmdd` plus a
//! sequence of at least two digits allocated from what is already on the
//! server.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use shipwright_common::{FtpEntry, ZipType};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::FtpConfig;
use crate::errors::FtpError;

pub const INTRODUCE_PREFIX: &str = "introduce";
pub const INTRODUCE_SUFFIX: &str = "txt";

#[async_trait]
pub trait FtpClient: Send + Sync {
    async fn list(&self) -> Result<Vec<FtpEntry>, FtpError>;
    async fn read(&self, name: &str) -> Result<Vec<u8>, FtpError>;
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), FtpError>;
    async fn upload(&self, local: &Path, remote_name: &str) -> Result<(), FtpError>;
}

// ── Versioning ───────────────────────────────────────────────────────

/// Highest `NN` among `<prefix>_<yyyymmdd>NN.<suffix>` entries for `date`,
/// or 0 when there are none.
pub fn today_version(entries: &[FtpEntry], prefix: &str, suffix: &str, date: NaiveDate) -> u32 {
    let pattern = format!(
        r"^{}_{}(\d{{2,}})\.{}$",
        regex::escape(prefix),
        date.format("%Y%m%d"),
        regex::escape(suffix)
    );
    let Ok(re) = Regex::new(&pattern) else {
        return 0;
    };

    entries
        .iter()
        .filter_map(|e| re.captures(&e.name))
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()))
        .max()
        .unwrap_or(0)
}

/// `version + 1`, zero-padded to two digits below 10.
pub fn next_version_string(version: u32) -> String {
    let next = version + 1;
    if next >= 10 {
        next.to_string()
    } else {
        format!("0{}", next)
    }
}

/// File names of one release upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub version: String,
    pub introduce: String,
    pub archive: String,
    pub checksum: String,
}

impl ArtifactNames {
    pub fn new(prefix: &str, date: NaiveDate, sequence: &str, zip_type: ZipType) -> Self {
        let version = format!("{}{}", date.format("%Y%m%d"), sequence);
        let archive_version = match zip_type {
            ZipType::Full => version.clone(),
            ZipType::Patch => format!("patch_{}", version),
        };
        Self {
            introduce: format!("{}_{}.{}", INTRODUCE_PREFIX, version, INTRODUCE_SUFFIX),
            archive: format!("{}_{}.zip", prefix, archive_version),
            checksum: format!("{}_{}.zip.txt", prefix, archive_version),
            version,
        }
    }

    /// Upload order: introduction, archive, checksum.
    pub fn in_upload_order(&self) -> [&str; 3] {
        [
            self.introduce.as_str(),
            self.archive.as_str(),
            self.checksum.as_str(),
        ]
    }
}

/// Reject anything but a plain file name inside the drop directory.
pub fn check_remote_name(name: &str) -> Result<(), FtpError> {
    let plain = !name.trim().is_empty()
        && !name.contains(['/', '\\'])
        && !name.contains("..")
        && !name.chars().any(char::is_control);
    if plain {
        Ok(())
    } else {
        Err(FtpError::InvalidName {
            name: name.to_string(),
        })
    }
}

// ── Operator ─────────────────────────────────────────────────────────

pub struct FtpOperator {
    project: String,
    client: Arc<dyn FtpClient>,
}

impl FtpOperator {
    pub fn new(project: impl Into<String>, client: Arc<dyn FtpClient>) -> Self {
        Self {
            project: project.into(),
            client,
        }
    }

    /// List the drop directory, keeping names that match `filter` if given.
    pub async fn list(&self, filter: Option<&str>) -> Result<Vec<FtpEntry>, FtpError> {
        let re = match filter.filter(|f| !f.is_empty()) {
            Some(pattern) => Some(Regex::new(pattern).map_err(|source| FtpError::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            })?),
            None => None,
        };

        let entries = self.client.list().await?;
        Ok(match re {
            Some(re) => entries.into_iter().filter(|e| re.is_match(&e.name)).collect(),
            None => entries,
        })
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>, FtpError> {
        check_remote_name(name)?;
        self.client.read(name).await
    }

    pub async fn write(&self, name: &str, data: &[u8]) -> Result<(), FtpError> {
        check_remote_name(name)?;
        self.client.write(name, data).await?;
        tracing::info!(project = %self.project, file = %name, bytes = data.len(), "ftp file written");
        Ok(())
    }

    pub async fn upload(&self, local: &Path, remote_name: &str) -> Result<(), FtpError> {
        check_remote_name(remote_name)?;
        if !tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Err(FtpError::MissingArtifact {
                path: local.to_path_buf(),
            });
        }
        self.client.upload(local, remote_name).await?;
        tracing::info!(project = %self.project, file = %remote_name, "artifact uploaded");
        Ok(())
    }

    /// Next free sequence number for `date`, e.g. `"02"`.
    pub async fn next_version(&self, date: NaiveDate) -> Result<String, FtpError> {
        let entries = self.client.list().await?;
        let current = today_version(&entries, INTRODUCE_PREFIX, INTRODUCE_SUFFIX, date);
        Ok(next_version_string(current))
    }
}

// ── curl-backed client ───────────────────────────────────────────────

/// FTP through the `curl` binary: `MLSD` listings, `-T` uploads.
///
/// Credentials go to curl as a config file on stdin, never on the command
/// line. Every path segment is percent-encoded.
pub struct CurlFtpClient {
    settings: FtpConfig,
}

impl CurlFtpClient {
    pub fn new(settings: FtpConfig) -> Self {
        Self { settings }
    }

    fn dir_url(&self) -> String {
        let mut url = format!("ftp://{}:{}/", self.settings.host, self.settings.port);
        for segment in self.settings.work_dir.split('/').filter(|s| !s.is_empty()) {
            url.push_str(&urlencoding::encode(segment));
            url.push('/');
        }
        url
    }

    fn url(&self, name: &str) -> Result<String, FtpError> {
        check_remote_name(name)?;
        Ok(format!("{}{}", self.dir_url(), urlencoding::encode(name)))
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--silent".to_string(),
            "--show-error".to_string(),
            "--connect-timeout".to_string(),
            self.settings.timeout.to_string(),
            "--config".to_string(),
            "-".to_string(),
        ]
    }

    /// The `--config -` body fed to curl on stdin.
    fn credentials(&self) -> String {
        format!(
            "user = \"{}:{}\"\n",
            quote_config(&self.settings.username),
            quote_config(&self.settings.password)
        )
    }

    async fn curl(
        &self,
        operation: &'static str,
        target: &str,
        args: Vec<String>,
    ) -> Result<Vec<u8>, FtpError> {
        let mut child = Command::new("curl")
            .args(self.base_args())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| FtpError::Spawn { operation, source })?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(self.credentials().as_bytes())
                .await
                .map_err(|source| FtpError::Spawn { operation, source })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| FtpError::Spawn { operation, source })?;

        if !output.status.success() {
            return Err(FtpError::Transfer {
                operation,
                target: target.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn put_file(&self, operation: &'static str, local: &Path, remote_name: &str) -> Result<(), FtpError> {
        let url = self.url(remote_name)?;
        let args = vec![
            "--upload-file".to_string(),
            local.display().to_string(),
            url,
        ];
        self.curl(operation, remote_name, args).await.map(|_| ())
    }
}

/// Escape a value for a double-quoted curl config string.
fn quote_config(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Copy `data` into a temporary file; stdin is taken by the credentials.
async fn stage(data: &[u8]) -> Result<NamedTempFile, FtpError> {
    let data = data.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(&data)?;
        file.flush()?;
        Ok(file)
    })
    .await
    .map_err(|e| FtpError::Stage(std::io::Error::other(e)))?
    .map_err(FtpError::Stage)
}

#[async_trait]
impl FtpClient for CurlFtpClient {
    async fn list(&self) -> Result<Vec<FtpEntry>, FtpError> {
        let url = self.dir_url();
        let out = self
            .curl("list", &url, vec!["--request".into(), "MLSD".into(), url.clone()])
            .await?;
        Ok(parse_mlsd(&String::from_utf8_lossy(&out)))
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, FtpError> {
        let url = self.url(name)?;
        self.curl("read", name, vec![url]).await
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), FtpError> {
        let staged = stage(data).await?;
        self.put_file("write", staged.path(), name).await
    }

    async fn upload(&self, local: &Path, remote_name: &str) -> Result<(), FtpError> {
        self.put_file("upload", local, remote_name).await
    }
}

/// Parse `MLSD` lines (`type=file;size=12;modify=20200313081530; name`),
/// keeping plain files only.
fn parse_mlsd(listing: &str) -> Vec<FtpEntry> {
    listing
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (facts, name) = line.split_once(' ')?;
            let mut kind = "";
            let mut size = 0u64;
            let mut modified = None;

            for fact in facts.split(';').filter(|f| !f.is_empty()) {
                let (key, value) = fact.split_once('=')?;
                match key.to_ascii_lowercase().as_str() {
                    "type" => kind = value,
                    "size" => size = value.parse().unwrap_or(0),
                    "modify" => {
                        modified = value
                            .get(..14)
                            .and_then(|v| NaiveDateTime::parse_from_str(v, "%Y%m%d%H%M%S").ok())
                            .map(|dt| dt.and_utc());
                    }
                    _ => {}
                }
            }

            kind.eq_ignore_ascii_case("file").then(|| FtpEntry {
                name: name.to_string(),
                size,
                modified,
            })
        })
        .collect()
}
