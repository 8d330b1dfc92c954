//! Zero-shot classification facade

use serde::Serialize;
use tracing::instrument;

use super::{ApiClient, Backend, ModelRegistry};
use crate::classification::{LabelScores, LocalClassifier};
use crate::config::Config;
use crate::error::Result;
use crate::input::OneOrMany;

pub const TASK: &str = "text-classification";
pub const DEFAULT_LOCAL_MODEL: &str = "bart-large-mnli";
pub const DEFAULT_API_MODEL: &str = "english";

#[derive(Serialize)]
struct ClassificationRequest<'a> {
    text: &'a OneOrMany<String>,
    labels: &'a OneOrMany<Vec<String>>,
    model: &'a str,
}

/// Scores candidate labels for texts, locally or through the API
pub struct TextClassification {
    backend: Backend<dyn LocalClassifier>,
}

impl TextClassification {
    pub fn local(model: Box<dyn LocalClassifier>) -> Self {
        Self {
            backend: Backend::Local(model),
        }
    }

    pub fn remote(client: ApiClient, model: Option<&str>) -> Self {
        Self {
            backend: Backend::Remote {
                client,
                model: model.unwrap_or(DEFAULT_API_MODEL).to_string(),
            },
        }
    }

    pub fn from_config(config: &Config, registry: &ModelRegistry<dyn LocalClassifier>) -> Result<Self> {
        let backend = Backend::select(
            config.tasks.local,
            config.tasks.classification_model.as_deref(),
            registry,
            config.device.resolve(),
            || ApiClient::new(&config.api),
            DEFAULT_API_MODEL,
        )?;
        Ok(Self { backend })
    }

    pub fn is_local(&self) -> bool {
        self.backend.is_local()
    }

    /// Score `labels` for `text`: one label list for a single text, one
    /// label list per text for a list
    #[instrument(skip_all, fields(inputs = text.len()))]
    pub async fn classify(
        &self,
        text: &OneOrMany<String>,
        labels: &OneOrMany<Vec<String>>,
    ) -> Result<OneOrMany<LabelScores>> {
        match &self.backend {
            Backend::Local(model) => model.classify(text, labels),
            Backend::Remote { client, model } => {
                let body = serde_json::to_value(ClassificationRequest {
                    text,
                    labels,
                    model,
                })?;
                if text.is_many() {
                    Ok(OneOrMany::Many(client.call::<Vec<LabelScores>>(TASK, body).await?))
                } else {
                    Ok(OneOrMany::One(client.call::<LabelScores>(TASK, body).await?))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::tasks::api::tests::RecordingTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_remote_classification_keeps_label_order() {
        let transport = RecordingTransport::new(json!({
            "output": {"food": 0.99, "sport": 0.01}
        }));
        let client = ApiClient::with_transport(&ApiConfig::default(), transport.clone());
        let facade = TextClassification::remote(client, None);
        let labels = OneOrMany::One(vec!["food".to_string(), "sport".to_string()]);

        let scores = facade
            .classify(&"I love pizza".into(), &labels)
            .await
            .unwrap()
            .into_one()
            .unwrap();

        assert_eq!(scores.labels().collect::<Vec<_>>(), vec!["food", "sport"]);
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].0, "https://api.example/text-classification");
        assert_eq!(
            requests[0].2,
            json!({"text": "I love pizza", "labels": ["food", "sport"], "model": "english"})
        );
    }

    #[tokio::test]
    async fn test_remote_error_message_is_surfaced() {
        let transport = RecordingTransport::new(json!({"message": "Rate limit exceeded"}));
        let client = ApiClient::with_transport(&ApiConfig::default(), transport);
        let facade = TextClassification::remote(client, Some("multilingual"));

        let err = facade
            .classify(&"x".into(), &OneOrMany::One(vec!["a".to_string()]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to make API request: Rate limit exceeded");
    }
}
