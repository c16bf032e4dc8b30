//! OCI registry source
//!
//! Pulls Helm charts stored as OCI artifacts through the registry v2 API.
//! `repo` is `oci://<host>/<namespace>`, `path` the chart name and
//! `version` the tag. Registries answering 401 are retried with a bearer
//! token obtained from the realm advertised in `WWW-Authenticate`.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use super::{unpack_chart, TemplateFetcher, TemplateSource};
use crate::auth::Credentials;
use crate::crd::{TemplateRef, TemplateSourceType};
use crate::error::{Error, Result};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CHART_LAYER_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Deserialize)]
struct ImageManifest {
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: String,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry coordinates parsed from a TemplateRef
#[derive(Debug, PartialEq, Eq)]
struct Coordinates {
    host: String,
    repository: String,
    tag: String,
}

impl Coordinates {
    fn parse(reference: &TemplateRef) -> Option<Self> {
        let rest = reference
            .source_url
            .strip_prefix("oci://")
            .unwrap_or(&reference.source_url)
            .trim_matches('/');
        let (host, namespace) = match rest.split_once('/') {
            Some((host, ns)) => (host, ns.trim_matches('/')),
            None => (rest, ""),
        };
        let chart = reference.path.trim_matches('/');
        let repository = match (namespace.is_empty(), chart.is_empty()) {
            (_, true) => namespace.to_string(),
            (true, false) => chart.to_string(),
            (false, false) => format!("{namespace}/{chart}"),
        };
        if host.is_empty() || repository.is_empty() {
            return None;
        }
        let tag = if reference.version.is_empty() {
            DEFAULT_TAG.to_string()
        } else {
            reference.version.clone()
        };
        Some(Self {
            host: host.to_string(),
            repository,
            tag,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OciFetcher {
    http: reqwest::Client,
    plain_http: bool,
}

impl OciFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            plain_http: false,
        }
    }

    /// Talk to registries over plain HTTP (local registries and tests)
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    fn registry_base(&self, host: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{scheme}://{host}")
    }

    /// Send a request, negotiating a bearer token once on 401
    async fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
        token: &mut Option<String>,
        credentials: &Credentials,
        source_url: &str,
    ) -> Result<Response> {
        let with_auth = |rb: RequestBuilder, token: &Option<String>| match (token, credentials) {
            (Some(t), _) => rb.header(AUTHORIZATION, format!("Bearer {t}")),
            (None, Credentials::Basic { username, password }) => rb.basic_auth(username, Some(password)),
            (None, Credentials::Anonymous) => rb,
        };

        let response = with_auth(build(), token)
            .send()
            .await
            .map_err(|e| Error::unreachable(source_url, e))?;
        if response.status() != StatusCode::UNAUTHORIZED || token.is_some() {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };
        *token = Some(self.fetch_token(&challenge, credentials, source_url).await?);

        with_auth(build(), token)
            .send()
            .await
            .map_err(|e| Error::unreachable(source_url, e))
    }

    async fn fetch_token(
        &self,
        challenge: &HashMap<String, String>,
        credentials: &Credentials,
        source_url: &str,
    ) -> Result<String> {
        let realm = challenge
            .get("realm")
            .ok_or_else(|| Error::unreachable(source_url, "bearer challenge without realm"))?;
        let query: Vec<(&str, &str)> = ["service", "scope"]
            .into_iter()
            .filter_map(|k| challenge.get(k).map(|v| (k, v.as_str())))
            .collect();

        let mut request = self.http.get(realm).query(&query);
        if let Credentials::Basic { username, password } = credentials {
            request = request.basic_auth(username, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::unreachable(source_url, e))?;
        if !response.status().is_success() {
            return Err(Error::unreachable(
                source_url,
                format!("token endpoint returned {}", response.status()),
            ));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::unreachable(source_url, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::unreachable(source_url, "token endpoint returned no token"))
    }
}

#[async_trait]
impl TemplateFetcher for OciFetcher {
    fn source_type(&self) -> TemplateSourceType {
        TemplateSourceType::Oci
    }

    #[instrument(skip(self, credentials), fields(template = %reference))]
    async fn fetch(&self, reference: &TemplateRef, credentials: &Credentials) -> Result<TemplateSource> {
        let label = reference.to_string();
        let source_url = reference.source_url.as_str();
        let coords = Coordinates::parse(reference)
            .ok_or_else(|| Error::invalid_template(&label, "expected oci://<host>/<repository>"))?;
        let base = self.registry_base(&coords.host);
        let mut token = None;

        let manifest_url = format!("{base}/v2/{}/manifests/{}", coords.repository, coords.tag);
        info!("Pulling chart manifest {}", manifest_url);
        let response = self
            .send(
                || self.http.get(&manifest_url).header(ACCEPT, MANIFEST_MEDIA_TYPE),
                &mut token,
                credentials,
                source_url,
            )
            .await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::invalid_template(
                    &label,
                    format!("tag '{}' not found in {}", coords.tag, coords.repository),
                ))
            }
            s => {
                return Err(Error::unreachable(
                    source_url,
                    format!("manifest request returned {s}"),
                ))
            }
        }
        let manifest: ImageManifest = response
            .json()
            .await
            .map_err(|e| Error::invalid_template(&label, format!("malformed manifest: {e}")))?;

        let layer = manifest
            .layers
            .iter()
            .find(|l| l.media_type == CHART_LAYER_MEDIA_TYPE)
            .ok_or_else(|| Error::invalid_template(&label, "manifest has no Helm chart layer"))?;

        let blob_url = format!("{base}/v2/{}/blobs/{}", coords.repository, layer.digest);
        let response = self
            .send(|| self.http.get(&blob_url), &mut token, credentials, source_url)
            .await?;
        if !response.status().is_success() {
            return Err(Error::unreachable(
                source_url,
                format!("blob request returned {}", response.status()),
            ));
        }
        let archive = response
            .bytes()
            .await
            .map_err(|e| Error::unreachable(source_url, e))?;

        let actual = format!("sha256:{}", hex::encode(Sha256::digest(&archive)));
        if actual != layer.digest {
            return Err(Error::invalid_template(
                &label,
                format!("layer digest mismatch: expected {}, got {actual}", layer.digest),
            ));
        }
        debug!("Chart layer digest verified: {}", actual);

        let files = unpack_chart(&archive, &label).await?;
        Ok(TemplateSource {
            files,
            revision: actual,
        })
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let params = header.strip_prefix("Bearer ")?;
    let mut out = HashMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.strip_prefix('"')?;
        let (value, after_value) = after_key.split_once('"')?;
        out.insert(key.trim().to_string(), value.to_string());
        rest = after_value.trim_start_matches(',').trim();
    }
    Some(out)
}
