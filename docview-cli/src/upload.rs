use anyhow::{Context, Result};
use docview_core::{SourceFile, ViewerConfig, ViewerError, ViewerResult};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};
use url::Url;

/// What the analysis service needs for one run.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub persona: String,
    pub job: String,
    pub files: Vec<SourceFile>,
}

impl UploadRequest {
    /// Checks the limits the service enforces, so a bad request never leaves the machine.
    pub fn validate(&self, max_documents: usize) -> ViewerResult<()> {
        if self.files.is_empty() {
            return Err(ViewerError::EmptyInput);
        }
        if self.files.len() > max_documents {
            return Err(ViewerError::TooManyDocuments {
                max: max_documents,
                got: self.files.len(),
            });
        }
        if self.persona.trim().is_empty() || self.job.trim().is_empty() {
            return Err(ViewerError::Upload("Persona and job are required.".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisResponse {
    pub summary: Value,
    #[serde(default)]
    pub execution_time_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Maps a finished HTTP exchange to the analysis result or the service's error message.
pub fn interpret_response(status: StatusCode, body: &str) -> ViewerResult<AnalysisResponse> {
    if status.is_success() {
        return serde_json::from_str(body)
            .map_err(|err| ViewerError::Upload(format!("malformed analysis response: {err}")));
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) if !error.trim().is_empty() => Err(ViewerError::Upload(error)),
        _ => Err(ViewerError::Upload(format!(
            "upload failed with status {}",
            status.as_u16()
        ))),
    }
}

pub struct AnalysisClient {
    client: reqwest::Client,
    endpoint: Url,
    media_type: String,
    max_documents: usize,
}

impl AnalysisClient {
    pub fn new(config: &ViewerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build upload client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            media_type: config.accepted_media_type.clone(),
            max_documents: config.max_documents,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sends every file as a `pdfs` part alongside the `persona` and `job` fields.
    #[instrument(skip(self, request), fields(endpoint = %self.endpoint, files = request.files.len()))]
    pub async fn submit(&self, request: &UploadRequest) -> ViewerResult<AnalysisResponse> {
        request.validate(self.max_documents)?;

        let mut form = reqwest::multipart::Form::new()
            .text("persona", request.persona.clone())
            .text("job", request.job.clone());
        for file in &request.files {
            let bytes = tokio::fs::read(&file.path).await.map_err(|err| {
                ViewerError::Upload(format!("failed to read {}: {err}", file.path.display()))
            })?;
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file.name.clone())
                .mime_str(&self.media_type)
                .map_err(|err| ViewerError::Upload(format!("invalid media type: {err}")))?;
            form = form.part("pdfs", part);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|err| ViewerError::Upload(format!("failed to reach analysis service: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ViewerError::Upload(format!("failed to read analysis response: {err}")))?;

        let analysis = interpret_response(status, &body)?;
        info!(
            status = status.as_u16(),
            seconds = ?analysis.execution_time_seconds,
            "analysis finished"
        );
        Ok(analysis)
    }
}
