//! Two-stage classification: resident brand classifier, then the brand's
//! model classifier through the cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use candle_core::{Device, Tensor};
use carsight_resilience::{retry_async, RetryPolicy};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::cache::{CacheSnapshot, ModelCache};
use crate::error::{ModelError, Result};
use crate::inference::{validate_top_k, BrandPrediction, InferenceEngine, Prediction};
use crate::loader::{load_from_path, LoadedModel, Stage};
use crate::store::HttpRemote;

/// Brands reported by stage one.
pub const BRAND_TOP_K: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub brand: String,
    pub accuracy: f64,
    pub total_classes: usize,
}

/// Stage-two outcome. A failure here does not fail the whole request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPrediction {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Vec<Prediction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelPrediction {
    fn failed(error: impl ToString) -> Self {
        Self { success: false, predictions: None, model_info: None, error: Some(error.to_string()) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrandStage {
    pub top_brands: Vec<BrandPrediction>,
    pub selected_brand: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub brand_prediction: BrandStage,
    pub model_prediction: ModelPrediction,
    pub cleanup_performed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrandModelSummary {
    pub architecture: String,
    pub num_classes: usize,
    pub accuracy: f64,
    pub device: String,
    pub model_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub brand_model: BrandModelSummary,
    pub auto_cleanup: bool,
    pub models: CacheSnapshot,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub auto_cleanup: bool,
    pub request_timeout: Duration,
}

/// Ensures the brand checkpoint exists locally, downloading it from `url`
/// with retries when it is missing.
pub async fn ensure_brand_checkpoint(path: &Path, url: Option<&str>, remote: &HttpRemote, policy: RetryPolicy) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    let url = url.filter(|u| !u.trim().is_empty()).ok_or_else(|| ModelError::NotConfigured { brand: "brand classifier".into() })?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| ModelError::download("brand classifier", e))?;
    }
    info!(path=%path.display(), "brand checkpoint missing, downloading");
    let part = path.with_extension("part");
    let bytes = retry_async(&policy, "brand_checkpoint_download", |_| remote.download_url("brand classifier", url, &part)).await;
    let bytes = match bytes {
        Ok(b) => b,
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
    };
    if bytes == 0 {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(ModelError::corrupt(path, "artifact empty after transfer"));
    }
    tokio::fs::rename(&part, path).await.map_err(|e| ModelError::download("brand classifier", e))?;
    Ok(())
}

/// Loads the always-resident brand classifier.
pub async fn load_brand_model(path: &Path) -> Result<Arc<LoadedModel>> {
    let path = path.to_path_buf();
    let model = tokio::task::spawn_blocking(move || load_from_path("brand", &path, Stage::Brand, &Device::Cpu)).await??;
    Ok(Arc::new(model))
}

#[derive(Debug, Clone)]
pub struct ClassifierService {
    brand_model: Arc<LoadedModel>,
    cache: ModelCache,
    engine: InferenceEngine,
    settings: ServiceSettings,
}

impl ClassifierService {
    pub fn new(brand_model: Arc<LoadedModel>, cache: ModelCache, engine: InferenceEngine, settings: ServiceSettings) -> Self {
        Self { brand_model, cache, engine, settings }
    }

    pub fn cache(&self) -> &ModelCache { &self.cache }

    /// Stage one only.
    pub async fn predict_brand(&self, image: &Tensor, top_k: usize) -> Result<Vec<BrandPrediction>> {
        self.engine.run_brands(&self.brand_model, image, top_k).await
    }

    /// Stage one (or `brand_hint`), stage two, then optional cleanup of the
    /// selected brand when stage two succeeded.
    #[instrument(skip(self, image), fields(hint = brand_hint.unwrap_or("")))]
    pub async fn classify(&self, image: &Tensor, top_k: usize, brand_hint: Option<&str>, cleanup_after: bool) -> Result<Classification> {
        validate_top_k(top_k)?;
        let top_brands = match brand_hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(hint) => vec![BrandPrediction { rank: 1, brand: hint.to_string(), confidence: 1.0, confidence_percent: 100.0 }],
            None => self.predict_brand(image, BRAND_TOP_K).await.inspect_err(|e| {
                error!(error=%e, kind = e.kind(), dims=?image.dims(), "brand stage failed");
            })?,
        };
        let selected_brand = match top_brands.first() {
            Some(best) => best.brand.clone(),
            None => return Err(ModelError::Unexpected("brand classifier produced no prediction".into())),
        };
        info!(brand=%selected_brand, "brand selected");

        let model_prediction = match tokio::time::timeout(self.settings.request_timeout, self.predict_model(image, &selected_brand, top_k)).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                warn!(brand=%selected_brand, error=%e, "model stage failed");
                ModelPrediction::failed(e)
            }
            Err(_) => {
                warn!(brand=%selected_brand, timeout_ms = self.settings.request_timeout.as_millis() as u64, "model stage timed out");
                ModelPrediction::failed(format!("model stage timed out after {}ms", self.settings.request_timeout.as_millis()))
            }
        };

        let cleanup_performed = (cleanup_after || self.settings.auto_cleanup) && model_prediction.success && self.cache.evict(&selected_brand);
        if cleanup_performed {
            info!(brand=%selected_brand, automatic = self.settings.auto_cleanup, "brand model cleaned up after use");
        }
        Ok(Classification {
            brand_prediction: BrandStage { top_brands, selected_brand },
            model_prediction,
            cleanup_performed,
        })
    }

    async fn predict_model(&self, image: &Tensor, brand: &str, top_k: usize) -> Result<ModelPrediction> {
        let model = self.cache.get_or_load(brand).await?;
        let predictions = self.engine.run_for_brand(&model, brand, image, top_k).await?;
        Ok(ModelPrediction {
            success: true,
            predictions: Some(predictions),
            model_info: Some(ModelInfo { brand: brand.to_string(), accuracy: model.best_val_acc, total_classes: model.descriptor.num_classes }),
            error: None,
        })
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            brand_model: BrandModelSummary {
                architecture: self.brand_model.descriptor.architecture.to_string(),
                num_classes: self.brand_model.descriptor.num_classes,
                accuracy: self.brand_model.best_val_acc,
                device: "cpu".into(),
                model_path: self.brand_model.source.clone(),
            },
            auto_cleanup: self.settings.auto_cleanup,
            models: self.cache.snapshot(),
        }
    }
}
