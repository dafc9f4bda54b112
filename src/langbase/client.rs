use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{PipeCreated, PipeDefinition, PipeRequest, PipeResponse};
use crate::agents::{ModelBackend, PersonaCatalog, PersonaConfig, PromptContext};
use crate::config::{LangbaseConfig, RequestConfig};
use crate::error::{LangbaseError, LangbaseResult};

const RUN_PATH: &str = "/v1/pipes/run";
const PIPES_PATH: &str = "/v1/pipes";

/// HTTP client for the Langbase Pipes API.
///
/// Makes exactly one attempt per call. Retry and backoff belong to the
/// persona adapter that owns the call.
#[derive(Clone)]
pub struct LangbaseClient {
    http: Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl LangbaseClient {
    pub fn new(config: &LangbaseConfig, request: RequestConfig) -> LangbaseResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(request.timeout_ms))
            .build()
            .map_err(LangbaseError::Http)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_ms: request.timeout_ms,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> LangbaseResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LangbaseError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    LangbaseError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LangbaseError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| LangbaseError::InvalidResponse {
                message: format!("{} returned an unreadable body: {}", path, e),
            })
    }

    /// Run a pipe once and return its raw response.
    pub async fn call_pipe(&self, request: PipeRequest) -> LangbaseResult<PipeResponse> {
        let started = Instant::now();
        let result: LangbaseResult<PipeResponse> = self.post(RUN_PATH, &request).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => debug!(
                pipe = %request.name,
                latency_ms,
                tokens = response.total_tokens(),
                "Pipe run completed"
            ),
            Err(e) => warn!(pipe = %request.name, latency_ms, error = %e, "Pipe run failed"),
        }
        result
    }

    /// Create or update the pipe backing one persona.
    ///
    /// A 409 means the pipe already exists, which is fine.
    pub async fn ensure_persona_pipe(&self, persona: &PersonaConfig) -> LangbaseResult<()> {
        let definition = PipeDefinition::from(persona);
        match self.post::<_, PipeCreated>(PIPES_PATH, &definition).await {
            Ok(created) => {
                info!(
                    pipe = %created.name,
                    persona = %persona.persona,
                    url = created.url.as_deref().unwrap_or("-"),
                    "Persona pipe ready"
                );
                Ok(())
            }
            Err(LangbaseError::Api { status, .. }) if status == StatusCode::CONFLICT.as_u16() => {
                debug!(pipe = %definition.name, "Persona pipe already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ensure_persona_pipes(&self, catalog: &PersonaCatalog) -> LangbaseResult<()> {
        for persona in catalog.iter() {
            self.ensure_persona_pipe(persona).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ModelBackend for LangbaseClient {
    async fn invoke(
        &self,
        persona: &PersonaConfig,
        context: &PromptContext,
    ) -> LangbaseResult<String> {
        let response = self
            .call_pipe(PipeRequest::for_persona(persona, context))
            .await?;
        if !response.success {
            return Err(LangbaseError::InvalidResponse {
                message: format!("pipe {} reported failure", persona.pipe_name),
            });
        }
        Ok(response.completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> LangbaseConfig {
        LangbaseConfig {
            api_key: "test_key".to_string(),
            base_url: base_url.to_string(),
        }
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let client =
            LangbaseClient::new(&config("http://localhost:8080/"), RequestConfig::default())
                .unwrap();
        assert_eq!(client.endpoint(RUN_PATH), "http://localhost:8080/v1/pipes/run");
    }

    #[test]
    fn test_timeout_taken_from_request_config() {
        let request = RequestConfig {
            timeout_ms: 1234,
            ..RequestConfig::default()
        };
        let client = LangbaseClient::new(&config("https://api.langbase.com"), request).unwrap();
        assert_eq!(client.timeout_ms, 1234);
    }
}
