//! Model table — in-memory catalog of the inference models this invoker may
//! pre-load, with their arrival statistics.
//!
//! An action is *inference-eligible* iff it has an entry here. The derived
//! fields follow a Poisson arrival model: with rate λ and a look-ahead window
//! `w`, `arrival_probability = 1 − exp(−λ·w)`, and the expected latency saved
//! by keeping the model resident is `arrival_probability · loading_latency`.

use crate::config::ModelConfig;
use std::collections::HashMap;
use std::sync::RwLock;

/// Descriptor of one ML model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    /// Fully-qualified owning action name
    pub action_name: String,
    /// Model identifier
    pub model_name: String,
    /// Cold-load latency (milliseconds)
    pub model_loading_latency_ms: u64,
    /// Arrival rate (invocations per minute)
    pub lambda: f64,
    /// Probability of at least one arrival within the current window
    pub arrival_probability: f64,
    /// Resident size (MB)
    pub model_size_mb: u64,
    /// `arrival_probability · model_loading_latency_ms`
    pub expected_saved_latency: f64,
}

impl ModelData {
    fn from_config(config: &ModelConfig) -> Self {
        let mut data = Self {
            action_name: config.action_name.clone(),
            model_name: config.model_name.clone(),
            model_loading_latency_ms: config.model_loading_latency_ms,
            lambda: config.initial_lambda,
            arrival_probability: 0.0,
            model_size_mb: config.model_size_mb,
            expected_saved_latency: 0.0,
        };
        data.recompute(1.0);
        data
    }

    /// Recompute the derived fields for a window of `w` minutes
    fn recompute(&mut self, window: f64) {
        self.arrival_probability = 1.0 - (-self.lambda * window).exp();
        self.expected_saved_latency =
            self.arrival_probability * self.model_loading_latency_ms as f64;
    }
}

/// Catalog of known models, keyed by owning action
pub struct ModelTable {
    models: RwLock<HashMap<String, ModelData>>,
}

impl ModelTable {
    /// Build the table from the boot catalog
    pub fn new(catalog: &[ModelConfig]) -> Self {
        let models = catalog
            .iter()
            .map(|c| (c.action_name.clone(), ModelData::from_config(c)))
            .collect();
        Self {
            models: RwLock::new(models),
        }
    }

    /// Whether `action` is inference-eligible
    pub fn is_inference_action(&self, action_fqn: &str) -> bool {
        self.models.read().unwrap().contains_key(action_fqn)
    }

    /// Model owned by `action`, if any
    pub fn find_by_action_name(&self, action_fqn: &str) -> Option<ModelData> {
        self.models.read().unwrap().get(action_fqn).cloned()
    }

    /// Snapshot of every model
    pub fn all(&self) -> Vec<ModelData> {
        self.models.read().unwrap().values().cloned().collect()
    }

    /// Update the arrival rate of `action`'s model
    pub fn update_lambda(&self, action_fqn: &str, lambda: f64) {
        if let Some(model) = self.models.write().unwrap().get_mut(action_fqn) {
            model.lambda = lambda;
        }
    }

    /// Recompute all derived fields for a window of `w` minutes
    pub fn update_all_derived(&self, window: f64) {
        for model in self.models.write().unwrap().values_mut() {
            model.recompute(window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<ModelConfig> {
        vec![
            ModelConfig {
                action_name: "guest/ptest04".into(),
                model_name: "ResNet50".into(),
                model_size_mb: 98,
                model_loading_latency_ms: 4200,
                initial_lambda: 0.5,
            },
            ModelConfig {
                action_name: "guest/ptest05".into(),
                model_name: "BERT-base".into(),
                model_size_mb: 420,
                model_loading_latency_ms: 9000,
                initial_lambda: 0.0,
            },
        ]
    }

    #[test]
    fn test_eligibility_and_lookup() {
        let table = ModelTable::new(&catalog());
        assert!(table.is_inference_action("guest/ptest04"));
        assert!(!table.is_inference_action("guest/hello"));

        let m = table.find_by_action_name("guest/ptest05").unwrap();
        assert_eq!(m.model_name, "BERT-base");
        assert_eq!(m.model_size_mb, 420);
        assert!(table.find_by_action_name("guest/hello").is_none());
    }

    #[test]
    fn test_derived_fields_follow_poisson_model() {
        let table = ModelTable::new(&catalog());
        table.update_lambda("guest/ptest04", 2.0);
        table.update_all_derived(1.0);

        let m = table.find_by_action_name("guest/ptest04").unwrap();
        let expected_p = 1.0 - (-2.0f64).exp();
        assert!((m.arrival_probability - expected_p).abs() < 1e-12);
        assert!((m.expected_saved_latency - expected_p * 4200.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_lambda_means_zero_probability() {
        let table = ModelTable::new(&catalog());
        table.update_all_derived(1.0);
        let m = table.find_by_action_name("guest/ptest05").unwrap();
        assert_eq!(m.arrival_probability, 0.0);
        assert_eq!(m.expected_saved_latency, 0.0);
    }

    #[test]
    fn test_window_scales_probability() {
        let table = ModelTable::new(&catalog());
        table.update_lambda("guest/ptest04", 0.1);

        table.update_all_derived(1.0);
        let p1 = table
            .find_by_action_name("guest/ptest04")
            .unwrap()
            .arrival_probability;

        table.update_all_derived(10.0);
        let p10 = table
            .find_by_action_name("guest/ptest04")
            .unwrap()
            .arrival_probability;

        assert!(p10 > p1);
        assert!((p10 - (1.0 - (-1.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_update_lambda_unknown_action_is_noop() {
        let table = ModelTable::new(&catalog());
        table.update_lambda("guest/unknown", 5.0);
        assert_eq!(table.all().len(), 2);
    }
}
