//! Release notice pages in object storage.
//!
//! Each configured environment has a `<env>.json` object holding the current
//! [`NoticeContent`] and a rendered `dev/<env>.html` page built from the
//! bucket's `index.html` template.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE};
use sha1::Sha1;
use shipwright_common::NoticeContent;

use crate::config::OssConfig;
use crate::errors::NoticeError;

type HmacSha1 = Hmac<Sha1>;

const TEMPLATE_KEY: &str = "index.html";
const OBJECT_ACL_HEADER: &str = "x-oss-object-acl";
const PUBLIC_READ_WRITE: &str = "public-read-write";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Raw object access.
#[async_trait]
pub trait NoticeStore: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, NoticeError>;
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), NoticeError>;
}

/// OSS object access over HTTP, signed with the configured access key.
/// Requests go out anonymous when no access key id is configured.
pub struct HttpNoticeStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    access_key: Option<(String, String)>,
}

impl HttpNoticeStore {
    pub fn new(settings: &OssConfig) -> Self {
        let access_key = (!settings.access_key_id.is_empty()).then(|| {
            (
                settings.access_key_id.clone(),
                settings.access_key_secret.clone(),
            )
        });
        Self {
            client: reqwest::Client::new(),
            base_url: bucket_url(&settings.end_point, &settings.bucket_name),
            bucket: settings.bucket_name.clone(),
            access_key,
        }
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        body: Option<(Vec<u8>, &str)>,
    ) -> Result<reqwest::Response, NoticeError> {
        let key = key.trim_start_matches('/');
        let date = Utc::now().format(HTTP_DATE).to_string();
        let content_type = body.as_ref().map(|(_, ct)| *ct).unwrap_or("");
        let oss_headers: Vec<(&str, &str)> = if body.is_some() {
            vec![(OBJECT_ACL_HEADER, PUBLIC_READ_WRITE)]
        } else {
            Vec::new()
        };

        let mut request = self
            .client
            .request(method.clone(), format!("{}/{}", self.base_url, key))
            .header(DATE, &date);
        for (name, value) in &oss_headers {
            request = request.header(*name, *value);
        }

        if let Some((id, secret)) = &self.access_key {
            let resource = format!("/{}/{}", self.bucket, key);
            let canonical = string_to_sign(method.as_str(), content_type, &date, &oss_headers, &resource);
            let signature = sign(secret, &canonical).ok_or_else(|| NoticeError::Signing {
                key: key.to_string(),
            })?;
            request = request.header(AUTHORIZATION, format!("OSS {}:{}", id, signature));
        }

        if let Some((bytes, content_type)) = body {
            request = request.header(CONTENT_TYPE, content_type).body(bytes);
        }

        let resp = request.send().await.map_err(|source| NoticeError::Http {
            key: key.to_string(),
            source,
        })?;
        if !resp.status().is_success() {
            return Err(NoticeError::Status {
                key: key.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }
}

/// `https://<bucket>.<endpoint>`, keeping an explicit scheme on the endpoint.
fn bucket_url(end_point: &str, bucket: &str) -> String {
    let (scheme, host) = match end_point.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("https", end_point),
    };
    format!("{}://{}.{}", scheme, bucket, host.trim_end_matches('/'))
}

/// OSS header-signature input:
/// `VERB\nContent-MD5\nContent-Type\nDate\n<x-oss-* headers><resource>`.
/// Content-MD5 is never sent and stays empty.
fn string_to_sign(
    verb: &str,
    content_type: &str,
    date: &str,
    oss_headers: &[(&str, &str)],
    resource: &str,
) -> String {
    let mut headers: Vec<(String, &str)> = oss_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort();

    let mut out = format!("{}\n\n{}\n{}\n", verb, content_type, date);
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push_str(resource);
    out
}

/// Base64 HMAC-SHA1 of `input` under `secret`.
fn sign(secret: &str, input: &str) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(input.as_bytes());
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl NoticeStore for HttpNoticeStore {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, NoticeError> {
        let resp = self.send(Method::GET, key, None).await?;
        let body = resp.bytes().await.map_err(|source| NoticeError::Http {
            key: key.to_string(),
            source,
        })?;
        Ok(body.to_vec())
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), NoticeError> {
        self.send(Method::PUT, key, Some((body, content_type))).await?;
        Ok(())
    }
}

pub struct NoticeOperator {
    project: String,
    settings: OssConfig,
    store: Arc<dyn NoticeStore>,
}

impl NoticeOperator {
    pub fn new(project: impl Into<String>, settings: OssConfig, store: Arc<dyn NoticeStore>) -> Self {
        Self {
            project: project.into(),
            settings,
            store,
        }
    }

    /// Environment name → public page URL.
    pub fn envs(&self) -> BTreeMap<String, String> {
        self.settings
            .envs
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    format!("{}/dev/{}.html", self.settings.proxy_url.trim_end_matches('/'), e.value),
                )
            })
            .collect()
    }

    /// Current notice for `env`. A missing or unreadable object reads as empty.
    pub async fn content(&self, env: &str) -> Result<NoticeContent, NoticeError> {
        self.check_env(env)?;

        let raw = match self.store.get_object(&content_key(env)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(project = %self.project, env = %env, error = %e, "no stored notice");
                return Ok(NoticeContent::default());
            }
        };

        Ok(serde_json::from_slice(&raw).unwrap_or_else(|e| {
            tracing::warn!(project = %self.project, env = %env, error = %e, "stored notice is not valid JSON");
            NoticeContent::default()
        }))
    }

    /// Store `content` and re-render the environment's page.
    pub async fn put_content(&self, env: &str, content: &NoticeContent) -> Result<(), NoticeError> {
        self.check_env(env)?;

        let json = serde_json::to_vec(content)?;
        self.store
            .put_object(&content_key(env), json, "application/json")
            .await?;

        let template = self.store.get_object(TEMPLATE_KEY).await?;
        let page = render_notice(&String::from_utf8_lossy(&template), content);
        self.store
            .put_object(&page_key(env), page.into_bytes(), "text/html; charset=utf-8")
            .await?;

        tracing::info!(project = %self.project, env = %env, "release notice updated");
        Ok(())
    }

    fn check_env(&self, env: &str) -> Result<(), NoticeError> {
        if self.settings.envs.iter().any(|e| e.name == env) {
            Ok(())
        } else {
            Err(NoticeError::UnknownEnv {
                env: env.to_string(),
            })
        }
    }
}

fn content_key(env: &str) -> String {
    format!("{}.json", env)
}

fn page_key(env: &str) -> String {
    format!("dev/{}.html", env)
}

pub fn render_notice(template: &str, content: &NoticeContent) -> String {
    template
        .replace("{{title}}", &content.title)
        .replace("{{time}}", &content.time)
        .replace("{{content}}", &content.content)
}
