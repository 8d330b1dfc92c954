//! Text generation facade

use serde::Serialize;
use tracing::instrument;

use super::{ApiClient, Backend, ModelRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::finetune::{FinetuneOrchestrator, FinetuneReport};
use crate::generation::{
    Generated, GenerationFinetuneOptions, GenerationOptions, LocalGenerator, FINETUNABLE_MODELS,
};
use crate::input::OneOrMany;

/// Endpoint and task name
pub const TASK: &str = "text-generation";
/// Registry key used when no local model is named
pub const DEFAULT_LOCAL_MODEL: &str = "gpt2";
/// API model used when no model is named
pub const DEFAULT_API_MODEL: &str = "gpt2-large";

#[derive(Serialize)]
struct GenerationRequest<'a> {
    text: &'a OneOrMany<String>,
    #[serde(flatten)]
    options: &'a GenerationOptions,
    model: &'a str,
}

/// Generates text continuations, locally or through the API
pub struct TextGeneration {
    backend: Backend<dyn LocalGenerator>,
    orchestrator: FinetuneOrchestrator,
    finetune_options: GenerationFinetuneOptions,
}

impl TextGeneration {
    /// Run a local model
    pub fn local(model: Box<dyn LocalGenerator>) -> Self {
        Self {
            backend: Backend::Local(model),
            orchestrator: FinetuneOrchestrator::default(),
            finetune_options: GenerationFinetuneOptions::default(),
        }
    }

    /// Call the API with `model`, or the default API model
    pub fn remote(client: ApiClient, model: Option<&str>) -> Self {
        Self {
            backend: Backend::Remote {
                client,
                model: model.unwrap_or(DEFAULT_API_MODEL).to_string(),
            },
            orchestrator: FinetuneOrchestrator::default(),
            finetune_options: GenerationFinetuneOptions::default(),
        }
    }

    /// Select the backend from configuration
    pub fn from_config(config: &Config, registry: &ModelRegistry<dyn LocalGenerator>) -> Result<Self> {
        let backend = Backend::select(
            config.tasks.local,
            config.tasks.generation_model.as_deref(),
            registry,
            config.device.resolve(),
            || ApiClient::new(&config.api),
            DEFAULT_API_MODEL,
        )?;
        Ok(Self {
            backend,
            orchestrator: FinetuneOrchestrator::from_config(&config.finetune.probe),
            finetune_options: GenerationFinetuneOptions::from_config(&config.finetune),
        })
    }

    pub fn with_orchestrator(mut self, orchestrator: FinetuneOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_finetune_options(mut self, options: GenerationFinetuneOptions) -> Self {
        self.finetune_options = options;
        self
    }

    /// Options `finetune` uses when the caller passes none
    pub fn finetune_options(&self) -> &GenerationFinetuneOptions {
        &self.finetune_options
    }

    pub fn is_local(&self) -> bool {
        self.backend.is_local()
    }

    /// Generate continuations for one text or a list of texts
    #[instrument(skip_all, fields(inputs = text.len()))]
    pub async fn generate(
        &self,
        text: &OneOrMany<String>,
        options: &GenerationOptions,
    ) -> Result<OneOrMany<Generated>> {
        match &self.backend {
            Backend::Local(model) => model.generate(text, options),
            Backend::Remote { client, model } => {
                let body = serde_json::to_value(GenerationRequest {
                    text,
                    options,
                    model,
                })?;
                if text.is_many() {
                    Ok(OneOrMany::Many(client.call::<Vec<Generated>>(TASK, body).await?))
                } else {
                    Ok(OneOrMany::One(client.call::<Generated>(TASK, body).await?))
                }
            }
        }
    }

    /// Whether `finetune` can run on the bound model
    pub fn supports_finetuning(&self) -> bool {
        match &self.backend {
            Backend::Local(model) => model.supports_finetuning(),
            Backend::Remote { .. } => false,
        }
    }

    /// Finetune the local model on parallel input/output lists.
    ///
    /// `None` uses [`TextGeneration::finetune_options`].
    pub fn finetune(
        &mut self,
        input_text: &[String],
        output_text: &[String],
        options: Option<&GenerationFinetuneOptions>,
    ) -> Result<FinetuneReport> {
        let options = options.unwrap_or(&self.finetune_options);
        match &mut self.backend {
            Backend::Local(model) if model.supports_finetuning() => {
                model.finetune(input_text, output_text, options, &self.orchestrator)
            }
            _ => Err(Error::unsupported(
                "This model does not support finetuning",
                FINETUNABLE_MODELS,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::handle::ModelInfo;
    use crate::tasks::api::tests::RecordingTransport;
    use serde_json::json;

    struct Upper {
        info: ModelInfo,
    }

    impl LocalGenerator for Upper {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn generate(
            &self,
            text: &OneOrMany<String>,
            _options: &GenerationOptions,
        ) -> Result<OneOrMany<Generated>> {
            Ok(text.clone().map(|t| OneOrMany::One(t.to_uppercase())))
        }

        fn supports_finetuning(&self) -> bool {
            false
        }

        fn finetune(
            &mut self,
            _input_text: &[String],
            _output_text: &[String],
            _options: &GenerationFinetuneOptions,
            _orchestrator: &FinetuneOrchestrator,
        ) -> Result<FinetuneReport> {
            panic!("finetune must not be reached without the capability")
        }
    }

    fn remote(response: serde_json::Value) -> (TextGeneration, std::sync::Arc<RecordingTransport>) {
        let transport = RecordingTransport::new(response);
        let client = ApiClient::with_transport(&ApiConfig::default(), transport.clone());
        (TextGeneration::remote(client, None), transport)
    }

    #[tokio::test]
    async fn test_remote_body_flattens_options_and_names_model() {
        let (facade, transport) = remote(json!({"output": "Once upon a time"}));
        let options = GenerationOptions {
            max_length: Some(20),
            num_generations: Some(1),
            ..Default::default()
        };

        let output = facade.generate(&"Once".into(), &options).await.unwrap();

        assert_eq!(output, OneOrMany::One(OneOrMany::One("Once upon a time".to_string())));
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].0, "https://api.example/text-generation");
        assert_eq!(
            requests[0].2,
            json!({"text": "Once", "max_length": 20, "num_generations": 1, "model": "gpt2-large"})
        );
    }

    #[tokio::test]
    async fn test_remote_list_input_decodes_list_output() {
        let (facade, _) = remote(json!({"output": ["a", ["b", "c"]]}));
        let text: OneOrMany<String> = vec!["x".to_string(), "y".to_string()].into();

        let output = facade.generate(&text, &GenerationOptions::default()).await.unwrap();

        assert_eq!(
            output,
            OneOrMany::Many(vec![
                OneOrMany::One("a".to_string()),
                OneOrMany::Many(vec!["b".to_string(), "c".to_string()]),
            ])
        );
    }

    #[tokio::test]
    async fn test_local_backend_skips_the_api() {
        let facade = TextGeneration::local(Box::new(Upper {
            info: ModelInfo::default(),
        }));
        assert!(facade.is_local());

        let output = facade
            .generate(&"hello".into(), &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(output, OneOrMany::One(OneOrMany::One("HELLO".to_string())));
    }

    #[test]
    fn test_finetune_unsupported_for_remote_and_incapable_models() {
        let (mut facade, transport) = remote(json!({"output": ""}));
        let inputs = vec!["q".to_string()];
        let err = facade
            .finetune(&inputs, &inputs, None)
            .unwrap_err();
        assert!(err.to_string().contains("try: t5, t5-base-qa-summary-emotion"));
        assert!(transport.requests.lock().unwrap().is_empty());

        let mut facade = TextGeneration::local(Box::new(Upper {
            info: ModelInfo::default(),
        }));
        assert!(!facade.supports_finetuning());
        assert!(matches!(
            facade.finetune(&inputs, &inputs, None),
            Err(Error::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_from_config_builds_named_local_model() {
        let mut config = Config::default();
        config.tasks.local = true;
        config.device.preference = crate::config::DevicePreference::Cpu;
        let registry: ModelRegistry<dyn LocalGenerator> =
            ModelRegistry::new(DEFAULT_LOCAL_MODEL).register(DEFAULT_LOCAL_MODEL, |_| {
                Ok(Box::new(Upper {
                    info: ModelInfo::default(),
                }) as Box<dyn LocalGenerator>)
            });

        let facade = TextGeneration::from_config(&config, &registry).unwrap();
        assert!(facade.is_local());

        config.tasks.generation_model = Some("gpt-j".to_string());
        assert!(matches!(
            TextGeneration::from_config(&config, &registry),
            Err(Error::Config(_))
        ));
    }
}
