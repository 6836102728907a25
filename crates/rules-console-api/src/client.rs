//! Blocking HTTP implementation of [`RulesRemote`] against the rules console service.

use std::io;
use std::time::Duration;

use rules_console_core::{RemoteError, Ruleset, RulesRemote};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::{SaveRulesRequest, API_CONTRACT_VERSION, SERVICE_CONTRACT_VERSION};

pub const BASE_URL_ENV: &str = "RULES_CONSOLE_BASE_URL";
pub const TIMEOUT_MS_ENV: &str = "RULES_CONSOLE_TIMEOUT_MS";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4010";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { base_url: DEFAULT_BASE_URL.to_string(), timeout_ms: DEFAULT_TIMEOUT_MS }
    }
}

impl RemoteConfig {
    /// Read `RULES_CONSOLE_BASE_URL` and `RULES_CONSOLE_TIMEOUT_MS`, falling back to defaults
    /// for unset or unusable values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default()
            .with_base_url(std::env::var(BASE_URL_ENV).ok().as_deref())
            .with_timeout_ms(std::env::var(TIMEOUT_MS_ENV).ok().and_then(|v| v.trim().parse().ok()))
    }

    /// Override the base URL. Blank values are ignored and trailing slashes trimmed.
    #[must_use]
    pub fn with_base_url(mut self, base_url: Option<&str>) -> Self {
        if let Some(normalized) = base_url
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
        {
            self.base_url = normalized;
        }
        self
    }

    /// Override the timeout, clamped to 100..=30000 ms.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        if let Some(timeout_ms) = timeout_ms {
            self.timeout_ms = timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        }
        self
    }
}

#[derive(Debug, Deserialize)]
struct ServiceEnvelope<T> {
    service_contract_version: String,
    api_contract_version: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpRulesRemote {
    agent: ureq::Agent,
    config: RemoteConfig,
}

impl HttpRulesRemote {
    #[must_use]
    pub fn new(config: RemoteConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(Duration::from_millis(config.timeout_ms)).build();
        Self { agent, config }
    }

    #[must_use]
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn rules_url(&self) -> String {
        format!("{}/v1/rules", self.config.base_url)
    }

    fn map_call_error(&self, err: ureq::Error) -> RemoteError {
        match err {
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_json::<ServiceErrorBody>()
                    .map_or_else(|_| "no error detail".to_string(), |body| body.error);
                if code >= 500 {
                    RemoteError::Unavailable(format!(
                        "rules service at {} failed with HTTP {code}: {message}",
                        self.config.base_url
                    ))
                } else {
                    RemoteError::Rejected(format!("HTTP {code}: {message}"))
                }
            }
            ureq::Error::Transport(transport) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .is_some_and(|io_err| {
                        matches!(io_err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
                    });
                if timed_out {
                    RemoteError::Timeout { timeout_ms: self.config.timeout_ms }
                } else {
                    RemoteError::Unavailable(format!(
                        "rules service is unavailable at {}: {transport}",
                        self.config.base_url
                    ))
                }
            }
        }
    }

    fn read_envelope<T: DeserializeOwned>(response: ureq::Response) -> Result<T, RemoteError> {
        let envelope: ServiceEnvelope<T> = response
            .into_json()
            .map_err(|err| RemoteError::MalformedPayload(format!("invalid service envelope: {err}")))?;

        if envelope.service_contract_version != SERVICE_CONTRACT_VERSION
            || envelope.api_contract_version != API_CONTRACT_VERSION
        {
            return Err(RemoteError::ContractMismatch {
                expected: format!("{SERVICE_CONTRACT_VERSION}/{API_CONTRACT_VERSION}"),
                actual: format!(
                    "{}/{}",
                    envelope.service_contract_version, envelope.api_contract_version
                ),
            });
        }
        Ok(envelope.data)
    }
}

impl RulesRemote for HttpRulesRemote {
    fn fetch_rulesets(&self) -> Result<Option<Vec<Ruleset>>, RemoteError> {
        let url = self.rules_url();
        debug!(%url, "fetching rules document");
        let response = self.agent.get(&url).call().map_err(|err| self.map_call_error(err))?;
        Self::read_envelope(response)
    }

    fn save_rulesets(&self, rulesets: &[Ruleset]) -> Result<Vec<Ruleset>, RemoteError> {
        let url = self.rules_url();
        debug!(%url, rulesets = rulesets.len(), "saving rules document");
        let body = SaveRulesRequest { data: rulesets.to_vec() };
        let response =
            self.agent.put(&url).send_json(&body).map_err(|err| self.map_call_error(err))?;
        Self::read_envelope(response)
    }
}
