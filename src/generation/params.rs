//! Generation parameter resolution
//!
//! Callers pass a loose option set; decoding needs one canonical config with
//! an unambiguous sampling flag. Resolution is applied in a fixed order:
//!
//! 1. `do_sample` starts from the caller's value, defaulting to `false`.
//! 2. Any sampling-affecting parameter that is set forces `do_sample = true`.
//! 3. `temperature == 0.0` forces `do_sample = false` and removes the
//!    temperature; an explicit "no randomness" request beats step 2.
//! 4. `num_generations` is renamed to `num_return_sequences`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Generation options as supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_return_sequences: Option<usize>,
    /// Alias of `num_return_sequences`; takes precedence when both are set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_generations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
}

impl GenerationOptions {
    /// Whether any parameter that only matters when sampling is set
    pub fn has_sampling_parameter(&self) -> bool {
        self.temperature.is_some()
            || self.top_k.is_some()
            || self.top_p.is_some()
            || self.repetition_penalty.is_some()
            || self.length_penalty.is_some()
            || self.num_beams.is_some()
            || self.num_return_sequences.is_some()
            || self.num_generations.is_some()
    }

    fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(t >= 0.0) {
                return Err(Error::invalid_input(format!("temperature must be >= 0, got {}", t)));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::invalid_input(format!("top_p must be in [0, 1], got {}", p)));
            }
        }
        if self.num_beams == Some(0) {
            return Err(Error::invalid_input("num_beams must be >= 1"));
        }
        if self.num_return_sequences == Some(0) || self.num_generations == Some(0) {
            return Err(Error::invalid_input("num_return_sequences must be >= 1"));
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(Error::invalid_input(format!(
                    "min_length ({}) exceeds max_length ({})",
                    min, max
                )));
            }
        }
        Ok(())
    }

    /// Resolve into the canonical decoding config
    pub fn resolve(&self) -> Result<GenerationConfig> {
        self.validate()?;

        let mut do_sample = self.do_sample.unwrap_or(false);
        if self.has_sampling_parameter() {
            do_sample = true;
        }

        let mut temperature = self.temperature;
        if temperature == Some(0.0) {
            do_sample = false;
            temperature = None;
        }

        let num_return_sequences = match (self.num_generations, self.num_return_sequences) {
            (Some(n), Some(m)) if n != m => {
                debug!("num_generations={} overrides num_return_sequences={}", n, m);
                Some(n)
            }
            (Some(n), _) => Some(n),
            (None, m) => m,
        };

        Ok(GenerationConfig {
            min_length: self.min_length,
            max_length: self.max_length,
            temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            length_penalty: self.length_penalty,
            num_beams: self.num_beams,
            num_return_sequences,
            do_sample,
        })
    }
}

/// Canonical decoding configuration handed to a generation model.
///
/// When `do_sample` is false the stochastic parameters are not honored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_return_sequences: Option<usize>,
    pub do_sample: bool,
}

impl GenerationConfig {
    /// Number of candidates produced per input (1 when unset)
    pub fn return_sequences(&self) -> usize {
        self.num_return_sequences.unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults_are_greedy() {
        let config = GenerationOptions::default().resolve().unwrap();
        assert!(!config.do_sample);
        assert_eq!(config.return_sequences(), 1);
    }

    #[test]
    fn test_explicit_do_sample_kept_without_parameters() {
        let options = GenerationOptions {
            do_sample: Some(true),
            ..Default::default()
        };
        assert!(options.resolve().unwrap().do_sample);
    }

    #[test]
    fn test_lengths_do_not_force_sampling() {
        let options = GenerationOptions {
            min_length: Some(10),
            max_length: Some(50),
            ..Default::default()
        };
        assert!(!options.resolve().unwrap().do_sample);
    }

    #[test]
    fn test_zero_temperature_overrides_everything() {
        let options = GenerationOptions {
            temperature: Some(0.0),
            top_k: Some(40),
            do_sample: Some(true),
            ..Default::default()
        };
        let config = options.resolve().unwrap();
        assert!(!config.do_sample);
        assert_eq!(config.temperature, None);
        assert_eq!(config.top_k, Some(40));

        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_num_generations_takes_precedence() {
        let options = GenerationOptions {
            num_generations: Some(3),
            num_return_sequences: Some(2),
            ..Default::default()
        };
        assert_eq!(options.resolve().unwrap().num_return_sequences, Some(3));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_top_p = GenerationOptions {
            top_p: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(bad_top_p.resolve(), Err(Error::InvalidInput(_))));

        let bad_temperature = GenerationOptions {
            temperature: Some(-0.1),
            ..Default::default()
        };
        assert!(bad_temperature.resolve().is_err());

        let bad_beams = GenerationOptions {
            num_beams: Some(0),
            ..Default::default()
        };
        assert!(bad_beams.resolve().is_err());
    }

    fn sampling_options() -> impl Strategy<Value = GenerationOptions> {
        (
            proptest::option::of(1usize..100),
            proptest::option::of(0.0f64..=1.0),
            proptest::option::of(0.5f64..2.0),
            proptest::option::of(0.5f64..2.0),
            proptest::option::of(1usize..8),
            proptest::option::of(1usize..8),
            proptest::option::of(any::<bool>()),
            proptest::option::of(0.01f64..2.0),
        )
            .prop_map(
                |(top_k, top_p, repetition_penalty, length_penalty, num_beams, nrs, do_sample, temperature)| {
                    GenerationOptions {
                        top_k,
                        top_p,
                        repetition_penalty,
                        length_penalty,
                        num_beams,
                        num_return_sequences: nrs,
                        do_sample,
                        temperature,
                        ..Default::default()
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn prop_any_sampling_parameter_enables_sampling(options in sampling_options()) {
            prop_assume!(options.has_sampling_parameter());
            let config = options.resolve().unwrap();
            prop_assert!(config.do_sample);
        }

        #[test]
        fn prop_zero_temperature_disables_sampling(options in sampling_options()) {
            let options = GenerationOptions { temperature: Some(0.0), ..options };
            let config = options.resolve().unwrap();
            prop_assert!(!config.do_sample);
            prop_assert!(config.temperature.is_none());
        }

        #[test]
        fn prop_num_generations_alias_is_identical(n in 1usize..16, options in sampling_options()) {
            let via_alias = GenerationOptions {
                num_generations: Some(n),
                num_return_sequences: None,
                ..options.clone()
            };
            let via_name = GenerationOptions {
                num_generations: None,
                num_return_sequences: Some(n),
                ..options
            };
            prop_assert_eq!(via_alias.resolve().unwrap(), via_name.resolve().unwrap());
        }
    }
}
