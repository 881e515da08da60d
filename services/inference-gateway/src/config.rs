use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::store::{parse_brand_map, StoreConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub service_name: String,
    pub health_port: u16,
    pub store: StoreSection,
    pub brand: BrandSection,
    pub inference: InferenceSection,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "inference-gateway".into(),
            health_port: 9095,
            store: StoreSection::default(),
            brand: BrandSection::default(),
            inference: InferenceSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub models_dir: PathBuf,
    pub legacy_dir: Option<PathBuf>,
    pub extension: String,
    pub architecture_tag: String,
    /// `"Brand:remote_id[:sha256],..."`
    pub brand_model_ids: String,
    pub remote_url_template: String,
    pub download_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models/car_models"),
            legacy_dir: Some(PathBuf::from("models/car_model")),
            extension: "safetensors".into(),
            architecture_tag: "efficientnet_b3".into(),
            brand_model_ids: String::new(),
            remote_url_template: "https://drive.google.com/uc?export=download&id={id}".into(),
            download_timeout_secs: 300,
        }
    }
}

impl StoreSection {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            models_dir: self.models_dir.clone(),
            legacy_dir: self.legacy_dir.clone(),
            extension: self.extension.trim_start_matches('.').to_string(),
            architecture_tag: self.architecture_tag.clone(),
        }
    }

    pub fn download_timeout(&self) -> Duration { Duration::from_secs(self.download_timeout_secs) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrandSection {
    pub model_path: PathBuf,
    pub model_url: Option<String>,
    pub bootstrap_attempts: usize,
}

impl Default for BrandSection {
    fn default() -> Self {
        Self { model_path: PathBuf::from("models/brand_model_efficientnet_b3.safetensors"), model_url: None, bootstrap_attempts: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSection {
    pub max_concurrent: usize,
    pub request_timeout_ms: u64,
    pub auto_cleanup: bool,
}

impl Default for InferenceSection {
    fn default() -> Self { Self { max_concurrent: 4, request_timeout_ms: 30_000, auto_cleanup: false } }
}

impl InferenceSection {
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
}

impl GatewayConfig {
    /// Every problem found, empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.health_port < 1000 {
            errors.push(format!("health_port {} is outside 1000..=65535", self.health_port));
        }
        if let Err(e) = parse_brand_map(&self.store.brand_model_ids) {
            errors.push(format!("store.brand_model_ids: {e}"));
        }
        if self.store.extension.trim_start_matches('.').is_empty() {
            errors.push("store.extension must not be empty".into());
        }
        if !self.store.remote_url_template.contains("{id}") {
            errors.push("store.remote_url_template must contain {id}".into());
        }
        if self.inference.max_concurrent == 0 {
            errors.push("inference.max_concurrent must be at least 1".into());
        }
        if self.inference.request_timeout_ms == 0 {
            errors.push("inference.request_timeout_ms must be positive".into());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = GatewayConfig::default();
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        assert_eq!(cfg.store.store_config().extension, "safetensors");
        assert_eq!(cfg.inference.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut cfg = GatewayConfig::default();
        cfg.health_port = 80;
        cfg.store.brand_model_ids = "Audi".into();
        cfg.store.extension = ".".into();
        cfg.inference.max_concurrent = 0;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("brand_model_ids")));
    }

    #[test]
    fn sections_deserialize_with_partial_input() {
        let raw = serde_json::json!({ "inference": { "auto_cleanup": true }, "store": { "legacy_dir": null } });
        let cfg: GatewayConfig = serde_json::from_value(raw).unwrap();
        assert!(cfg.inference.auto_cleanup);
        assert_eq!(cfg.inference.max_concurrent, 4);
        assert!(cfg.store.legacy_dir.is_none());
        assert_eq!(cfg.health_port, 9095);
    }
}
