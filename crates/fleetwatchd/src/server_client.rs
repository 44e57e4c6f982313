//! Fleet server client: update manifests, artifact downloads, telemetry.

use crate::error::{SinkError, SourceError};
use crate::source::{Artifact, ProgressFn, VersionInfo, VersionQuery, VersionSource};
use crate::telemetry::{TelemetryReport, TelemetrySink};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MANIFEST_PATH: &str = "/api/v1/agents/update/manifest";
const TELEMETRY_PATH: &str = "/api/v1/agents/update/telemetry";
const COMPONENT: &str = "agent";
const HASH_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct ManifestRequest<'a> {
    agent_id: &'a str,
    component: &'a str,
    platform: &'a str,
    arch: &'a str,
    channel: &'a str,
}

#[derive(Debug, Deserialize)]
struct ManifestResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    manifest: Option<VersionInfo>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for one fleet server.
pub struct ServerClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
    download_dir: PathBuf,
}

impl ServerClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
        download_dir: PathBuf,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("fleetwatch-agent/{}", fleetwatch_common::AGENT_VERSION))
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            http,
            request_timeout,
            download_dir,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn artifact_path(&self, info: &VersionInfo) -> PathBuf {
        let name = format!(
            "fleetwatch-agent-{}-{}-{}",
            sanitize(&info.version),
            sanitize(&info.platform),
            sanitize(&info.arch)
        );
        self.download_dir.join(name)
    }
}

/// Keep file names to a safe character set.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

#[async_trait]
impl VersionSource for ServerClient {
    async fn check_latest(&self, query: &VersionQuery) -> Result<Option<VersionInfo>, SourceError> {
        let body = ManifestRequest {
            agent_id: &query.agent_id,
            component: COMPONENT,
            platform: &query.platform,
            arch: &query.arch,
            channel: &query.channel,
        };

        let resp = self
            .authorized(self.http.post(self.url(MANIFEST_PATH)))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            debug!("No manifest published for {}/{}/{}", query.channel, query.platform, query.arch);
            return Ok(None);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SourceError::Server {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        let parsed: ManifestResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::InvalidManifest(e.to_string()))?;

        if !parsed.success {
            return Err(SourceError::Server {
                status: status.as_u16(),
                message: parsed.message.unwrap_or_else(|| "manifest request rejected".to_string()),
            });
        }

        match parsed.manifest {
            Some(manifest) if manifest.version.trim().is_empty() => Err(
                SourceError::InvalidManifest("manifest has no version".to_string()),
            ),
            other => Ok(other),
        }
    }

    async fn download(
        &self,
        info: &VersionInfo,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Artifact, SourceError> {
        if info.download_url.is_empty() {
            return Err(SourceError::InvalidManifest("manifest has no download_url".to_string()));
        }

        fs::create_dir_all(&self.download_dir).await?;
        let dest = self.artifact_path(info);
        let partial = partial_path(&dest);

        let resume_from = match fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.authorized(self.http.get(self.url(&info.download_url)));
        if resume_from > 0 {
            info!("Resuming download of {} at byte {}", info.version, resume_from);
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        }

        let mut resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            resp = request.send() => resp?,
        };

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Stale partial file; next attempt starts over.
            let _ = fs::remove_file(&partial).await;
            return Err(SourceError::Server {
                status: status.as_u16(),
                message: "resume offset rejected".to_string(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Server {
                status: status.as_u16(),
                message: format!("artifact download failed for {}", info.version),
            });
        }

        let appending = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if appending {
            OpenOptions::new().append(true).open(&partial).await?
        } else {
            File::create(&partial).await?
        };
        let mut done = if appending { resume_from } else { 0 };

        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let total = if info.size_bytes > 0 {
            info.size_bytes
        } else {
            content_length.map(|len| len + done).unwrap_or(0)
        };
        progress(done, total);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(SourceError::Cancelled);
                }
                chunk = resp.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await?;
            done += chunk.len() as u64;
            progress(done, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&partial, &dest).await?;
        info!("Downloaded {} ({} bytes) to {}", info.version, done, dest.display());

        Ok(Artifact {
            version: info.version.clone(),
            path: dest,
            sha256: info.sha256.clone(),
            size_bytes: info.size_bytes,
        })
    }

    async fn verify(&self, artifact: &Artifact) -> Result<(), SourceError> {
        let result = verify_file(artifact).await;
        if let Err(ref e) = result {
            if e.is_verification() {
                warn!("Discarding artifact {}: {}", artifact.path.display(), e);
                let _ = fs::remove_file(&artifact.path).await;
            }
        }
        result
    }
}

/// Stream the artifact through SHA-256 and compare size and digest.
pub async fn verify_file(artifact: &Artifact) -> Result<(), SourceError> {
    let expected = artifact.sha256.trim().to_ascii_lowercase();
    if expected.is_empty() {
        return Err(SourceError::InvalidManifest("manifest has no sha256".to_string()));
    }

    let mut file = File::open(&artifact.path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    if artifact.size_bytes > 0 && size != artifact.size_bytes {
        return Err(SourceError::SizeMismatch {
            expected: artifact.size_bytes,
            actual: size,
        });
    }

    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Err(SourceError::HashMismatch { expected, actual });
    }

    debug!("Verified {} ({} bytes)", artifact.path.display(), size);
    Ok(())
}

#[async_trait]
impl TelemetrySink for ServerClient {
    async fn report(&self, report: &TelemetryReport) -> Result<(), SinkError> {
        let resp = self
            .authorized(self.http.post(self.url(TELEMETRY_PATH)))
            .timeout(self.request_timeout)
            .json(report)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SinkError::Delivery(format!("server returned {}", resp.status())));
        }
        Ok(())
    }
}
