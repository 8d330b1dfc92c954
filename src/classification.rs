//! Zero-shot classification through natural language inference
//!
//! Every (text, label) pair becomes a premise/hypothesis pair
//! `"{text}" / "This example is {label}."`. The model's entailment and
//! contradiction logits are softmaxed against each other and the entailment
//! probability is the label's score. Pairs are scored one forward pass at a
//! time.

use candle_core::{Tensor, D};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::handle::{ModelHandle, ModelInfo, ModelObject};
use crate::input::OneOrMany;
use crate::tokenizer::{batch_tensor, TextTokenizer};

/// An NLI model producing `[batch, num_classes]` logits for encoded pairs
pub trait EntailmentModel: ModelObject {
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;
}

/// Positions of the contradiction and entailment classes in the logits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntailmentIndices {
    pub contradiction: usize,
    pub entailment: usize,
}

impl Default for EntailmentIndices {
    /// MNLI ordering: contradiction, neutral, entailment
    fn default() -> Self {
        Self {
            contradiction: 0,
            entailment: 2,
        }
    }
}

/// Label probabilities for one text, in the caller's label order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelScores(Vec<(String, f32)>);

impl LabelScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the score for `label`. A label already present keeps its
    /// position and takes the new score.
    pub fn push(&mut self, label: impl Into<String>, score: f32) {
        let label = label.into();
        match self.0.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = score,
            None => self.0.push((label, score)),
        }
    }

    /// Score for `label`
    pub fn get(&self, label: &str) -> Option<f32> {
        self.0.iter().find(|(l, _)| l == label).map(|(_, s)| *s)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(l, _)| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(l, s)| (l.as_str(), *s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<(String, f32)> {
        self.0
    }
}

impl Serialize for LabelScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, score) in &self.0 {
            map.serialize_entry(label, score)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LabelScores {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> std::result::Result<Self, De::Error> {
        struct ScoresVisitor;

        impl<'de> Visitor<'de> for ScoresVisitor {
            type Value = LabelScores;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of label to probability")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<LabelScores, A::Error> {
                let mut scores = LabelScores(Vec::with_capacity(access.size_hint().unwrap_or(0)));
                while let Some((label, score)) = access.next_entry::<String, f32>()? {
                    scores.push(label, score);
                }
                Ok(scores)
            }
        }

        deserializer.deserialize_map(ScoresVisitor)
    }
}

/// Object-safe view of a local classifier, used by the task facade
pub trait LocalClassifier {
    fn info(&self) -> &ModelInfo;

    fn classify(
        &self,
        text: &OneOrMany<String>,
        labels: &OneOrMany<Vec<String>>,
    ) -> Result<OneOrMany<LabelScores>>;
}

/// Zero-shot classification adapter over a model handle
pub struct ClassificationModel<M, T> {
    handle: ModelHandle<M, T>,
    indices: EntailmentIndices,
    max_length: usize,
}

impl<M: EntailmentModel, T: TextTokenizer> ClassificationModel<M, T> {
    pub fn new(handle: ModelHandle<M, T>) -> Self {
        Self {
            handle,
            indices: EntailmentIndices::default(),
            max_length: 512,
        }
    }

    /// Use a model whose label order differs from MNLI
    pub fn with_indices(mut self, indices: EntailmentIndices) -> Self {
        self.indices = indices;
        self
    }

    /// Token limit for the premise/hypothesis pair
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn handle(&self) -> &ModelHandle<M, T> {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle<M, T> {
        &mut self.handle
    }

    /// Score every label for one text or for a list of texts.
    ///
    /// A single text takes one label list. A list of texts takes one label
    /// list per text.
    #[instrument(skip_all, fields(model = %self.handle.info().name, inputs = text.len()))]
    pub fn classify(
        &self,
        text: &OneOrMany<String>,
        labels: &OneOrMany<Vec<String>>,
    ) -> Result<OneOrMany<LabelScores>> {
        match (text, labels) {
            (OneOrMany::One(text), OneOrMany::One(labels)) => {
                Ok(OneOrMany::One(self.classify_one(text, labels)?))
            }
            (OneOrMany::Many(texts), OneOrMany::Many(label_sets)) => {
                if texts.len() != label_sets.len() {
                    return Err(Error::precondition(format!(
                        "got {} texts but {} label lists",
                        texts.len(),
                        label_sets.len()
                    )));
                }
                let results = texts
                    .iter()
                    .zip(label_sets)
                    .map(|(text, labels)| self.classify_one(text, labels))
                    .collect::<Result<Vec<_>>>()?;
                Ok(OneOrMany::Many(results))
            }
            (OneOrMany::One(_), OneOrMany::Many(_)) => Err(Error::precondition(
                "a single text takes a single list of labels",
            )),
            (OneOrMany::Many(_), OneOrMany::One(_)) => Err(Error::precondition(
                "a list of texts takes one list of labels per text",
            )),
        }
    }

    fn classify_one(&self, text: &str, labels: &[String]) -> Result<LabelScores> {
        let mut scores = LabelScores::new();
        for label in labels {
            let score = self.entailment_probability(text, label)?;
            debug!("{:?} -> {}: {:.4}", text, label, score);
            scores.push(label.clone(), score);
        }
        Ok(scores)
    }

    fn entailment_probability(&self, text: &str, label: &str) -> Result<f32> {
        let tokenizer = self.handle.require_tokenizer()?;
        let hypothesis = hypothesis(label);
        let encoded = tokenizer.encode_pair(text, &hypothesis, Some(self.max_length))?;

        let device = self.handle.tensor_device();
        let input_ids = batch_tensor(&[encoded.input_ids.as_slice()], device)?;
        let attention_mask = batch_tensor(&[encoded.attention_mask.as_slice()], device)?;

        let logits = self
            .handle
            .model()
            .logits(&input_ids, &attention_mask)
            .map_err(|e| Error::delegate("classification", e))?;

        entailment_score(&logits, self.indices)
    }
}

impl<M: EntailmentModel, T: TextTokenizer> LocalClassifier for ClassificationModel<M, T> {
    fn info(&self) -> &ModelInfo {
        self.handle.info()
    }

    fn classify(
        &self,
        text: &OneOrMany<String>,
        labels: &OneOrMany<Vec<String>>,
    ) -> Result<OneOrMany<LabelScores>> {
        ClassificationModel::classify(self, text, labels)
    }
}

/// Hypothesis sentence for a candidate label
pub fn hypothesis(label: &str) -> String {
    format!("This example is {}.", label)
}

/// Entailment probability from `[1, num_classes]` logits, softmaxed over
/// the contradiction/entailment pair only
pub fn entailment_score(logits: &Tensor, indices: EntailmentIndices) -> Result<f32> {
    let num_classes = logits.dim(D::Minus1)?;
    if indices.contradiction >= num_classes || indices.entailment >= num_classes {
        return Err(Error::invalid_input(format!(
            "entailment indices {:?} out of range for {} classes",
            indices, num_classes
        )));
    }

    let pair = Tensor::new(
        &[indices.contradiction as u32, indices.entailment as u32],
        logits.device(),
    )?;
    let selected = logits.index_select(&pair, D::Minus1)?;
    let probs = candle_nn::ops::softmax(&selected, D::Minus1)?;
    let probs = probs.flatten_all()?.to_vec1::<f32>()?;
    Ok(probs[1])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::Device;
    use crate::handle::Mode;
    use crate::tokenizer::{MockTextTokenizer, TokenizedInput};
    use approx::assert_abs_diff_eq;

    /// Token id the fake tokenizer emits when the hypothesis mentions food
    const FOOD: u32 = 7;

    /// Entails strongly when the last token is `FOOD`, contradicts otherwise
    pub(crate) struct FoodNli {
        mode: Mode,
        candle: candle_core::Device,
    }

    impl FoodNli {
        pub fn new() -> Self {
            Self {
                mode: Mode::Eval,
                candle: candle_core::Device::Cpu,
            }
        }
    }

    impl ModelObject for FoodNli {
        fn to_device(&mut self, _device: Device) -> Result<()> {
            Ok(())
        }

        fn set_mode(&mut self, mode: Mode) {
            self.mode = mode;
        }

        fn mode(&self) -> Mode {
            self.mode
        }

        fn tensor_device(&self) -> &candle_core::Device {
            &self.candle
        }
    }

    impl EntailmentModel for FoodNli {
        fn logits(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
            let ids = input_ids.squeeze(0)?.to_vec1::<u32>()?;
            let row: [f32; 3] = if ids.last() == Some(&FOOD) {
                [0.0, 1.0, 5.0]
            } else {
                [5.0, 1.0, 0.0]
            };
            Ok(Tensor::new(&[row], &self.candle)?)
        }
    }

    pub(crate) fn pair_tokenizer() -> MockTextTokenizer {
        let mut tokenizer = MockTextTokenizer::new();
        tokenizer.expect_encode_pair().returning(|_, hypothesis, _| {
            let last = if hypothesis.contains("food") { FOOD } else { 3 };
            Ok(TokenizedInput {
                input_ids: vec![1, 2, last],
                attention_mask: vec![1, 1, 1],
            })
        });
        tokenizer
    }

    fn classifier() -> ClassificationModel<FoodNli, MockTextTokenizer> {
        let handle = ModelHandle::from_parts("nli", FoodNli::new(), Device::Cpu)
            .unwrap()
            .with_tokenizer(pair_tokenizer());
        ClassificationModel::new(handle)
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hypothesis_template() {
        assert_eq!(hypothesis("food"), "This example is food.");
    }

    #[test]
    fn test_single_text_scores_labels_in_order() {
        let result = classifier()
            .classify(&"I love pizza".into(), &OneOrMany::One(labels(&["food", "weather"])))
            .unwrap();
        let scores = result.into_one().unwrap();

        assert_eq!(scores.labels().collect::<Vec<_>>(), vec!["food", "weather"]);
        for (_, score) in scores.iter() {
            assert!((0.0..=1.0).contains(&score));
        }
        let food = scores.get("food").unwrap();
        let weather = scores.get("weather").unwrap();
        assert!(food > 0.99);
        assert!(weather < 0.01);
    }

    #[test]
    fn test_softmax_ignores_neutral_class() {
        let logits = Tensor::new(&[[0.0f32, 100.0, 0.0]], &candle_core::Device::Cpu).unwrap();
        let score = entailment_score(&logits, EntailmentIndices::default()).unwrap();
        assert_abs_diff_eq!(score, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_custom_indices_flip_scores() {
        let handle = ModelHandle::from_parts("nli", FoodNli::new(), Device::Cpu)
            .unwrap()
            .with_tokenizer(pair_tokenizer());
        let flipped = ClassificationModel::new(handle).with_indices(EntailmentIndices {
            contradiction: 2,
            entailment: 0,
        });

        let scores = flipped
            .classify(&"pizza".into(), &OneOrMany::One(labels(&["food"])))
            .unwrap()
            .into_one()
            .unwrap();
        assert!(scores.get("food").unwrap() < 0.01);
    }

    #[test]
    fn test_hypothesis_reaches_tokenizer_with_limit() {
        let mut tokenizer = MockTextTokenizer::new();
        tokenizer
            .expect_encode_pair()
            .withf(|premise, hypothesis, max_length| {
                premise == "sunny day"
                    && hypothesis == "This example is weather."
                    && *max_length == Some(64)
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(TokenizedInput {
                    input_ids: vec![1],
                    attention_mask: vec![1],
                })
            });
        let handle = ModelHandle::from_parts("nli", FoodNli::new(), Device::Cpu)
            .unwrap()
            .with_tokenizer(tokenizer);
        let model = ClassificationModel::new(handle).with_max_length(64);

        model
            .classify(&"sunny day".into(), &OneOrMany::One(labels(&["weather"])))
            .unwrap();
    }

    #[test]
    fn test_list_of_texts_pairs_with_label_lists() {
        let texts = OneOrMany::Many(vec!["pizza".to_string(), "rain".to_string()]);
        let label_sets = OneOrMany::Many(vec![labels(&["food"]), labels(&["weather", "food"])]);

        let results = classifier().classify(&texts, &label_sets).unwrap().into_many().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[1].labels().collect::<Vec<_>>(), vec!["weather", "food"]);
    }

    #[test]
    fn test_mismatched_lists_are_precondition_errors() {
        let texts = OneOrMany::Many(vec!["a".to_string(), "b".to_string()]);
        let label_sets = OneOrMany::Many(vec![labels(&["x"])]);
        assert!(matches!(
            classifier().classify(&texts, &label_sets),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            classifier().classify(&texts, &OneOrMany::One(labels(&["x"]))),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_label_scores_serialize_as_ordered_map() {
        let mut scores = LabelScores::new();
        scores.push("weather", 0.25);
        scores.push("food", 0.75);

        let json = serde_json::to_string(&scores).unwrap();
        assert_eq!(json, r#"{"weather":0.25,"food":0.75}"#);

        let back: LabelScores = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scores);
    }

    #[test]
    fn test_label_scores_repeated_label_replaces_in_place() {
        let mut scores = LabelScores::new();
        scores.push("weather", 0.25);
        scores.push("food", 0.75);
        scores.push("weather", 0.5);

        assert_eq!(scores.len(), 2);
        assert_eq!(scores.get("weather"), Some(0.5));
        assert_eq!(scores.labels().collect::<Vec<_>>(), vec!["weather", "food"]);
        assert_eq!(
            serde_json::to_string(&scores).unwrap(),
            r#"{"weather":0.5,"food":0.75}"#
        );
    }
}
