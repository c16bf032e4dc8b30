//! Helm chart repository source
//!
//! Reads `<repo>/index.yaml`, picks the chart named by `path` at the
//! requested version (newest entry when the version is empty), downloads the
//! archive and unpacks it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use super::{unpack_chart, TemplateFetcher, TemplateSource};
use crate::auth::Credentials;
use crate::crd::{TemplateRef, TemplateSourceType};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RepositoryIndex {
    #[serde(default)]
    entries: BTreeMap<String, Vec<ChartEntry>>,
}

#[derive(Debug, Deserialize)]
struct ChartEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HelmRepoFetcher {
    http: reqwest::Client,
}

impl HelmRepoFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn get(&self, url: &str, credentials: &Credentials, source_url: &str) -> Result<Vec<u8>> {
        let mut request = self.http.get(url);
        if let Credentials::Basic { username, password } = credentials {
            request = request.basic_auth(username, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::unreachable(source_url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::unreachable(source_url, format!("GET {url} returned {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::unreachable(source_url, e))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl TemplateFetcher for HelmRepoFetcher {
    fn source_type(&self) -> TemplateSourceType {
        TemplateSourceType::HelmRepo
    }

    #[instrument(skip(self, credentials), fields(template = %reference))]
    async fn fetch(&self, reference: &TemplateRef, credentials: &Credentials) -> Result<TemplateSource> {
        let label = reference.to_string();
        let base = reference.source_url.trim_end_matches('/');
        let chart = reference.path.trim_matches('/');

        let raw_index = self
            .get(&format!("{base}/index.yaml"), credentials, base)
            .await?;
        let index: RepositoryIndex = serde_yaml::from_slice(&raw_index)
            .map_err(|e| Error::unreachable(base, format!("malformed index.yaml: {e}")))?;

        let entry = select_entry(&index, chart, &reference.version).ok_or_else(|| {
            Error::invalid_template(
                &label,
                format!("chart '{chart}' has no version matching '{}'", reference.version),
            )
        })?;
        let archive_url = entry
            .urls
            .first()
            .map(|u| resolve_url(base, u))
            .ok_or_else(|| Error::invalid_template(&label, "index entry has no download URL"))?;

        info!("Downloading chart {} {} from {}", chart, entry.version, archive_url);
        let archive = self.get(&archive_url, credentials, base).await?;

        let digest = hex::encode(Sha256::digest(&archive));
        if let Some(expected) = entry.digest.as_deref().filter(|d| !d.is_empty()) {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(Error::invalid_template(
                    &label,
                    format!("archive digest {digest} does not match index digest {expected}"),
                ));
            }
            debug!("Chart digest verified: {}", digest);
        }

        let files = unpack_chart(&archive, &label).await?;
        Ok(TemplateSource {
            files,
            revision: format!("{}@sha256:{digest}", entry.version),
        })
    }
}

fn select_entry<'a>(index: &'a RepositoryIndex, chart: &str, version: &str) -> Option<&'a ChartEntry> {
    let entries = index.entries.get(chart)?;
    if version.is_empty() {
        return entries.first();
    }
    let wanted = version.trim_start_matches('v');
    entries
        .iter()
        .find(|e| e.version == version || e.version.trim_start_matches('v') == wanted)
}

fn resolve_url(base: &str, url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("{base}/{}", url.trim_start_matches('/'))
    }
}
