use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use courtside_model::{DataTypeSpec, PartitionKey, SourceId, SubUnitId};

use super::{RawArtifact, ScrapeError, Scraper};
use crate::config::HttpConfig;
use crate::error::{CollectError, Result};

/// Data-driven scraper: renders a URL template per request and returns the
/// response body untouched.
///
/// Templates may use `{data_type}`, `{partition}` and `{sub_unit}`.
#[derive(Clone)]
pub struct HttpScraper {
    source: SourceId,
    template: String,
    extension: String,
    client: reqwest::Client,
}

impl fmt::Debug for HttpScraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpScraper")
            .field("source", &self.source)
            .field("template", &self.template)
            .field("extension", &self.extension)
            .finish()
    }
}

impl HttpScraper {
    pub fn new(
        source: SourceId,
        template: impl Into<String>,
        user_agent: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .build()
            .map_err(|err| {
                CollectError::InvalidConfig(format!("http client for {source}: {err}"))
            })?;
        Ok(Self {
            source,
            template: template.into(),
            extension: "json".into(),
            client,
        })
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// One scraper per source with a configured URL template.
    pub fn from_config(config: &HttpConfig, request_timeout: Duration) -> Result<Vec<Self>> {
        config
            .url_templates
            .iter()
            .map(|(source, template)| {
                Ok(
                    Self::new(source.clone(), template, &config.user_agent, request_timeout)?
                        .with_extension(config.extension_for(source)),
                )
            })
            .collect()
    }

    pub fn render(
        &self,
        spec: &DataTypeSpec,
        partition: &PartitionKey,
        sub_unit: &SubUnitId,
    ) -> String {
        self.template
            .replace("{data_type}", spec.id.as_str())
            .replace("{partition}", partition.as_str())
            .replace("{sub_unit}", sub_unit.as_str())
    }
}

fn transport_error(err: reqwest::Error) -> ScrapeError {
    if err.is_timeout() {
        ScrapeError::Timeout
    } else {
        ScrapeError::Connection(err.to_string())
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    fn source(&self) -> &SourceId {
        &self.source
    }

    fn extension(&self, _spec: &DataTypeSpec) -> &str {
        &self.extension
    }

    async fn fetch(
        &self,
        spec: &DataTypeSpec,
        partition: &PartitionKey,
        sub_unit: &SubUnitId,
    ) -> std::result::Result<RawArtifact, ScrapeError> {
        let url = self.render(spec, partition, sub_unit);
        tracing::debug!(target: "courtside::executor", %url, "fetching");

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Http {
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await.map_err(transport_error)?;

        let mut artifact = RawArtifact::new(bytes.to_vec());
        artifact.content_type = content_type;
        Ok(artifact)
    }
}
