//! Kubernetes-backed k6 client.
//!
//! Talks to the k6-operator's TestRun custom resources and their backing
//! pods over the Kubernetes HTTP API. Every request carries a bounded
//! timeout; HTTP 404 is the only response classified as definitive
//! absence.
//!
//! A TestRun may be backed by zero, one, or (with parallelism or
//! platform-level retries) several pods. Pods are resolved first by the
//! `job-name` label taken from the TestRun status, then by the `k6_cr`
//! label the operator stamps on runner pods. For phase decisions the most
//! recently created pod is authoritative; for logs, all pods contribute.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::{phase_from_stage, JobPhase, OrchestrationClient, OrchestrationError, PhaseReport};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Connection settings for the Kubernetes API.
#[derive(Debug, Clone)]
pub struct K6Config {
    /// Base URL of the API server.
    pub api_url: String,

    /// Namespace the k6-operator runs TestRuns in.
    pub namespace: String,

    /// Bearer token; resolved from the service account when in-cluster.
    pub token: Option<String>,

    /// Extra CA certificate for the API server, PEM format.
    pub ca_cert_file: Option<PathBuf>,

    /// Skip TLS verification (dev clusters only).
    pub insecure_tls: bool,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for K6Config {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            namespace: "k6-runs".to_string(),
            token: None,
            ca_cert_file: None,
            insecure_tls: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl K6Config {
    /// Load configuration from environment variables, falling back to
    /// in-cluster defaults when `KUBERNETES_SERVICE_HOST` is present.
    pub fn from_env() -> Self {
        let api_url = std::env::var("KUBE_API_URL").ok().unwrap_or_else(|| {
            match (
                std::env::var("KUBERNETES_SERVICE_HOST"),
                std::env::var("KUBERNETES_SERVICE_PORT"),
            ) {
                (Ok(host), Ok(port)) => format!("https://{host}:{port}"),
                (Ok(host), Err(_)) => format!("https://{host}:443"),
                _ => K6Config::default().api_url,
            }
        });

        let namespace =
            std::env::var("K6_NAMESPACE").unwrap_or_else(|_| "k6-runs".to_string());

        let token = std::env::var("KUBE_TOKEN").ok().or_else(|| {
            let path = std::env::var("KUBE_TOKEN_FILE")
                .unwrap_or_else(|_| SERVICE_ACCOUNT_TOKEN.to_string());
            std::fs::read_to_string(path)
                .ok()
                .map(|t| t.trim().to_string())
        });

        let ca_cert_file = std::env::var("KUBE_CA_CERT_FILE")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(SERVICE_ACCOUNT_CA);
                default.exists().then_some(default)
            });

        let insecure_tls = std::env::var("KUBE_INSECURE_TLS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let request_timeout = std::env::var("KUBE_REQUEST_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        Self {
            api_url,
            namespace,
            token,
            ca_cert_file,
            insecure_tls,
            request_timeout,
        }
    }
}

/// Failures building the client from its configuration.
#[derive(Debug, Error)]
pub enum K6BuildError {
    #[error("failed to read CA certificate: {0}")]
    CaCertRead(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// HTTP client for the orchestration platform.
pub struct K6Client {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl K6Client {
    pub fn new(config: K6Config) -> Result<Self, K6BuildError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .use_rustls_tls();

        if let Some(path) = &config.ca_cert_file {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if config.insecure_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token: config.token,
        })
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch_testrun(&self, name: &str) -> Result<TestRunResource, OrchestrationError> {
        let url = format!(
            "{}/apis/k6.io/v1alpha1/namespaces/{}/testruns/{}",
            self.base_url, self.namespace, name
        );
        let resp = self.get(url).send().await.map_err(classify)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(OrchestrationError::NotFound(name.to_string())),
            status if !status.is_success() => Err(OrchestrationError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            }),
            _ => resp.json().await.map_err(classify),
        }
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, OrchestrationError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods",
            self.base_url, self.namespace
        );
        let resp = self
            .get(url)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestrationError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let list: PodList = resp.json().await.map_err(classify)?;
        Ok(list.items)
    }

    /// Resolve the pods backing a TestRun: by the batch job name from its
    /// status when available, otherwise by the operator's `k6_cr` label.
    async fn find_pods(
        &self,
        testrun_name: &str,
        backing_job: Option<&str>,
    ) -> Result<Vec<Pod>, OrchestrationError> {
        if let Some(job) = backing_job {
            let pods = self.list_pods(&format!("job-name={job}")).await?;
            if !pods.is_empty() {
                return Ok(pods);
            }
        }
        self.list_pods(&format!("k6_cr={testrun_name}")).await
    }

    async fn pod_log(&self, pod_name: &str, tail_lines: i64) -> Result<String, OrchestrationError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/log",
            self.base_url, self.namespace, pod_name
        );
        let resp = self
            .get(url)
            .query(&[
                ("tailLines", tail_lines.to_string()),
                ("timestamps", "true".to_string()),
            ])
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestrationError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        resp.text().await.map_err(classify)
    }
}

#[async_trait]
impl OrchestrationClient for K6Client {
    async fn get_job_phase(&self, job_name: &str) -> Result<PhaseReport, OrchestrationError> {
        let resource = self.fetch_testrun(job_name).await?;
        let status = resource.status.unwrap_or_default();
        let stage = status.stage.unwrap_or_default();

        let mut report = PhaseReport::new(phase_from_stage(&stage));
        if report.phase == JobPhase::Failed {
            report.detail = Some(format!("test run reported stage '{stage}'"));
        }

        // A finished stage only says the run ended; whether it passed its
        // thresholds shows up in the runner pod's phase.
        if stage == "finished" {
            match self.find_pods(job_name, status.job_name.as_deref()).await {
                Ok(pods) => {
                    if let Some(pod) = newest_pod(pods) {
                        let pod_phase = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.phase.clone())
                            .unwrap_or_default();
                        if matches!(pod_phase.as_str(), "Failed" | "Error") {
                            report.phase = JobPhase::Failed;
                            report.detail = Some(format!(
                                "runner pod {} finished in phase {}",
                                pod.metadata.name, pod_phase
                            ));
                        }
                    }
                }
                // Pod inspection is advisory; a lookup failure must not
                // turn a finished run into a transient error.
                Err(e) => {
                    warn!(job = job_name, error = %e, "Failed to inspect runner pods");
                }
            }
        }

        Ok(report)
    }

    async fn get_logs(
        &self,
        job_name: &str,
        tail_lines: i64,
    ) -> Result<Option<String>, OrchestrationError> {
        let backing_job = match self.fetch_testrun(job_name).await {
            Ok(resource) => resource.status.unwrap_or_default().job_name,
            Err(OrchestrationError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut pods = self.find_pods(job_name, backing_job.as_deref()).await?;
        if pods.is_empty() {
            debug!(job = job_name, "No pods found for test run");
            return Ok(None);
        }

        // Chronological output when parallelism produced several pods.
        pods.sort_by_key(|p| p.metadata.creation_timestamp);

        let mut sections = Vec::with_capacity(pods.len());
        for pod in &pods {
            match self.pod_log(&pod.metadata.name, tail_lines).await {
                Ok(text) => {
                    sections.push(format!("=== Container: {} ===\n{}", pod.metadata.name, text));
                }
                Err(e) => {
                    warn!(pod = %pod.metadata.name, error = %e, "Failed to fetch pod logs");
                    sections.push(format!(
                        "=== Container: {} (unavailable) ===\n{}",
                        pod.metadata.name, e
                    ));
                }
            }
        }

        Ok(Some(sections.join("\n")))
    }
}

fn newest_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .max_by_key(|p| p.metadata.creation_timestamp)
}

fn classify(e: reqwest::Error) -> OrchestrationError {
    if e.is_timeout() {
        OrchestrationError::Timeout
    } else if e.is_decode() {
        OrchestrationError::Api {
            status: 0,
            message: format!("undecodable response: {e}"),
        }
    } else {
        OrchestrationError::Transport(e.to_string())
    }
}

// =============================================================================
// Kubernetes API payloads (only the fields we read)
// =============================================================================

#[derive(Debug, Deserialize)]
struct TestRunResource {
    #[serde(default)]
    status: Option<TestRunStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestRunStatus {
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    job_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    name: String,
    #[serde(default)]
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}
