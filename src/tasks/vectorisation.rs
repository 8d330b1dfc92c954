//! Text vectorisation facade

use serde::Serialize;
use tracing::instrument;

use super::{ApiClient, Backend, ModelRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::finetune::{FinetuneOrchestrator, FinetuneReport};
use crate::input::OneOrMany;
use crate::vectorisation::bert::load_bert_vectoriser;
use crate::vectorisation::{LocalVectoriser, VectorisationFinetuneOptions, TASK};

pub const DEFAULT_LOCAL_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_API_MODEL: &str = "english";

#[derive(Serialize)]
struct VectorisationRequest<'a> {
    text: &'a OneOrMany<String>,
    model: &'a str,
}

/// Registry with the bundled BERT sentence encoder under [`DEFAULT_LOCAL_MODEL`]
pub fn default_registry() -> ModelRegistry<dyn LocalVectoriser> {
    ModelRegistry::new(DEFAULT_LOCAL_MODEL).register(DEFAULT_LOCAL_MODEL, |device| {
        let model = load_bert_vectoriser(
            "sentence-transformers/all-MiniLM-L6-v2",
            Some(device),
        )?;
        Ok(Box::new(model) as Box<dyn LocalVectoriser>)
    })
}

/// Embeds texts, locally or through the API
pub struct TextVectorisation {
    backend: Backend<dyn LocalVectoriser>,
    orchestrator: FinetuneOrchestrator,
    finetune_options: VectorisationFinetuneOptions,
}

impl TextVectorisation {
    pub fn local(model: Box<dyn LocalVectoriser>) -> Self {
        Self {
            backend: Backend::Local(model),
            orchestrator: FinetuneOrchestrator::default(),
            finetune_options: VectorisationFinetuneOptions::default(),
        }
    }

    pub fn remote(client: ApiClient, model: Option<&str>) -> Self {
        Self {
            backend: Backend::Remote {
                client,
                model: model.unwrap_or(DEFAULT_API_MODEL).to_string(),
            },
            orchestrator: FinetuneOrchestrator::default(),
            finetune_options: VectorisationFinetuneOptions::default(),
        }
    }

    pub fn from_config(config: &Config, registry: &ModelRegistry<dyn LocalVectoriser>) -> Result<Self> {
        let backend = Backend::select(
            config.tasks.local,
            config.tasks.vectorisation_model.as_deref(),
            registry,
            config.device.resolve(),
            || ApiClient::new(&config.api),
            DEFAULT_API_MODEL,
        )?;
        Ok(Self {
            backend,
            orchestrator: FinetuneOrchestrator::from_config(&config.finetune.probe),
            finetune_options: VectorisationFinetuneOptions::from_config(&config.finetune),
        })
    }

    pub fn with_orchestrator(mut self, orchestrator: FinetuneOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_finetune_options(mut self, options: VectorisationFinetuneOptions) -> Self {
        self.finetune_options = options;
        self
    }

    /// Options `finetune` uses when the caller passes none
    pub fn finetune_options(&self) -> &VectorisationFinetuneOptions {
        &self.finetune_options
    }

    pub fn is_local(&self) -> bool {
        self.backend.is_local()
    }

    /// Embed one text or a list of texts
    #[instrument(skip_all, fields(inputs = text.len()))]
    pub async fn vectorise(&self, text: &OneOrMany<String>) -> Result<OneOrMany<Vec<f32>>> {
        match &self.backend {
            Backend::Local(model) => model.vectorise(text),
            Backend::Remote { client, model } => {
                let body = serde_json::to_value(VectorisationRequest { text, model })?;
                if text.is_many() {
                    Ok(OneOrMany::Many(client.call::<Vec<Vec<f32>>>(TASK, body).await?))
                } else {
                    Ok(OneOrMany::One(client.call::<Vec<f32>>(TASK, body).await?))
                }
            }
        }
    }

    /// Finetune the local model on text pairs and target similarities in [0, 1].
    ///
    /// `None` uses [`TextVectorisation::finetune_options`].
    pub fn finetune(
        &mut self,
        text_pairs: &[(String, String)],
        similarity_scores: &[f32],
        options: Option<&VectorisationFinetuneOptions>,
    ) -> Result<FinetuneReport> {
        let options = options.unwrap_or(&self.finetune_options);
        match &mut self.backend {
            Backend::Local(model) => {
                model.finetune(text_pairs, similarity_scores, options, &self.orchestrator)
            }
            Backend::Remote { .. } => Err(Error::unsupported(
                "Remote models do not support finetuning",
                &[DEFAULT_LOCAL_MODEL],
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::tasks::api::tests::RecordingTransport;
    use serde_json::json;

    fn remote(response: serde_json::Value) -> (TextVectorisation, std::sync::Arc<RecordingTransport>) {
        let transport = RecordingTransport::new(response);
        let client = ApiClient::with_transport(&ApiConfig::default(), transport.clone());
        (TextVectorisation::remote(client, None), transport)
    }

    #[tokio::test]
    async fn test_remote_list_decodes_one_vector_per_text() {
        let (facade, transport) = remote(json!({"output": [[0.1, 0.2], [0.3, 0.4]]}));
        let text: OneOrMany<String> = vec!["a".to_string(), "b".to_string()].into();

        let vectors = facade.vectorise(&text).await.unwrap().into_many().unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.3, 0.4]);
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].0, "https://api.example/text-vectorisation");
        assert_eq!(requests[0].2, json!({"text": ["a", "b"], "model": "english"}));
    }

    #[test]
    fn test_remote_finetune_is_unsupported() {
        let (mut facade, _) = remote(json!({"output": []}));
        let result = facade.finetune(
            &[("a".to_string(), "b".to_string())],
            &[0.5],
            None,
        );
        assert!(matches!(result, Err(Error::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_default_registry_key() {
        let registry = default_registry();
        assert_eq!(registry.default_key(), DEFAULT_LOCAL_MODEL);
        assert!(registry.contains("all-MiniLM-L6-v2"));
    }
}
