use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Tensor};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::error::{ModelError, Result};
use crate::loader::LoadedModel;
use crate::metrics::{INFERENCE_LATENCY, UNKNOWN_INDICES};

pub const MAX_TOP_K: usize = 10;

/// One ranked class from a single forward pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassScore {
    pub rank: usize,
    pub class_index: usize,
    pub label: String,
    pub confidence: f64,
    pub confidence_percent: f64,
}

/// Stage-two result: a model name inside a caller-supplied brand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub rank: usize,
    pub brand: String,
    #[serde(rename = "model")]
    pub model_name: String,
    pub brand_model: String,
    pub confidence: f64,
    pub confidence_percent: f64,
}

/// Stage-one result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrandPrediction {
    pub rank: usize,
    pub brand: String,
    pub confidence: f64,
    pub confidence_percent: f64,
}

pub fn softmax(v: &mut [f32]) {
    if v.is_empty() { return; }
    let max = v.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for x in v.iter_mut() { *x = (*x - max).exp(); sum += *x; }
    if sum > 0.0 { for x in v.iter_mut() { *x /= sum; } }
}

/// Indices of the `k` largest values, descending; equal values keep
/// ascending index order.
pub fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k.min(probs.len()));
    ranked
}

/// Percent with two decimals.
pub fn percent(confidence: f64) -> f64 { (confidence * 100.0 * 100.0).round() / 100.0 }

pub fn validate_top_k(top_k: usize) -> Result<()> {
    if (1..=MAX_TOP_K).contains(&top_k) {
        Ok(())
    } else {
        Err(ModelError::InvalidRequest(format!("top_k must be within 1..={MAX_TOP_K}, got {top_k}")))
    }
}

/// Normalizes a single image to `[1, 3, H, W]` f32.
fn as_batch(image: &Tensor) -> Result<Tensor> {
    let batched = match image.dims() {
        [3, _, _] => image.unsqueeze(0)?,
        [1, 3, _, _] => image.clone(),
        dims => return Err(ModelError::InvalidRequest(format!("expected one image shaped [3, H, W] or [1, 3, H, W], got {dims:?}"))),
    };
    Ok(batched.to_dtype(DType::F32)?)
}

/// Runs forward passes on the blocking pool, at most `max_concurrent` at once.
#[derive(Debug, Clone)]
pub struct InferenceEngine {
    permits: Arc<Semaphore>,
}

impl InferenceEngine {
    pub fn new(max_concurrent: usize) -> Self { Self { permits: Arc::new(Semaphore::new(max_concurrent.max(1))) } }

    pub fn available_permits(&self) -> usize { self.permits.available_permits() }

    /// Ranked classes for one image. Unmapped indices come back as
    /// `Unknown_<index>`.
    pub async fn run(&self, model: &Arc<LoadedModel>, image: &Tensor, top_k: usize) -> Result<Vec<ClassScore>> {
        validate_top_k(top_k)?;
        let batch = as_batch(image)?;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ModelError::Unexpected("inference pool closed".into()))?;
        let started = Instant::now();
        let dims = batch.dims().to_vec();
        let net = model.clone();
        let forward = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let _permit = permit;
            let logits = net.network.forward(&batch)?;
            Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
        })
        .await
        .map_err(ModelError::from)
        .and_then(|r| r);
        let mut probs = match forward {
            Ok(p) => p,
            Err(e) => {
                error!(brand=%model.brand, architecture=%model.descriptor.architecture, classes=model.descriptor.num_classes, ?dims, error=%e, "forward pass failed");
                return Err(e);
            }
        };
        softmax(&mut probs);
        let ranked = top_k_scores(model, &probs, top_k);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        INFERENCE_LATENCY.record(elapsed_ms, &[KeyValue::new("brand", model.brand.clone())]);
        if let Some(best) = ranked.first() {
            debug!(brand=%model.brand, label=%best.label, confidence=best.confidence_percent, elapsed_ms, "inference done");
        }
        Ok(ranked)
    }

    /// Stage-two predictions labelled with `brand`.
    pub async fn run_for_brand(&self, model: &Arc<LoadedModel>, brand: &str, image: &Tensor, top_k: usize) -> Result<Vec<Prediction>> {
        let scores = self.run(model, image, top_k).await?;
        Ok(scores
            .into_iter()
            .map(|s| Prediction {
                rank: s.rank,
                brand: brand.to_string(),
                brand_model: format!("{brand} {}", s.label),
                model_name: s.label,
                confidence: s.confidence,
                confidence_percent: s.confidence_percent,
            })
            .collect())
    }

    /// Stage-one predictions; labels are brand names.
    pub async fn run_brands(&self, model: &Arc<LoadedModel>, image: &Tensor, top_k: usize) -> Result<Vec<BrandPrediction>> {
        let scores = self.run(model, image, top_k).await?;
        Ok(scores
            .into_iter()
            .map(|s| BrandPrediction { rank: s.rank, brand: s.label, confidence: s.confidence, confidence_percent: s.confidence_percent })
            .collect())
    }
}

fn top_k_scores(model: &LoadedModel, probs: &[f32], k: usize) -> Vec<ClassScore> {
    top_k(probs, k)
        .into_iter()
        .enumerate()
        .map(|(i, (class_index, p))| {
            let label = match model.class_index.name(class_index) {
                Some(name) => name.to_string(),
                None => {
                    UNKNOWN_INDICES.add(1, &[]);
                    warn!(brand=%model.brand, class_index, "class index has no name");
                    model.class_index.label(class_index).into_owned()
                }
            };
            let confidence = p as f64;
            ClassScore { rank: i + 1, class_index, label, confidence, confidence_percent: percent(confidence) }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ClassIndex;
    use crate::inspector::{Architecture, ModelDescriptor, Variant};
    use crate::network::ImageClassifier;
    use candle_core::Device;

    #[test]
    fn softmax_basic() {
        let mut v = vec![1.0, 2.0, 3.0];
        softmax(&mut v);
        let s: f32 = v.iter().sum();
        assert!((s - 1.0).abs() < 1e-5);
        assert!(v[2] > v[1] && v[1] > v[0]);
    }

    #[derive(Debug)]
    struct FixedLogits(Vec<f32>);

    impl ImageClassifier for FixedLogits {
        fn forward(&self, _images: &Tensor) -> candle_core::Result<Tensor> {
            if self.0.is_empty() {
                candle_core::bail!("weights unavailable");
            }
            Tensor::new(self.0.as_slice(), &Device::Cpu)?.unsqueeze(0)
        }
    }

    fn model(logits: Vec<f32>, names: &[&str]) -> Arc<LoadedModel> {
        let classes = logits.len();
        Arc::new(LoadedModel {
            brand: "Audi".into(),
            network: Box::new(FixedLogits(logits)),
            class_index: ClassIndex::new(names.iter().enumerate().map(|(i, n)| (i, n.to_string())).collect()),
            descriptor: ModelDescriptor { architecture: Architecture::Known(Variant::Small), hidden_size: 512, num_classes: classes },
            best_val_acc: 0.0,
            source: "Audi.safetensors".into(),
        })
    }

    fn image() -> Tensor { Tensor::zeros((3, 8, 8), DType::F32, &Device::Cpu).unwrap() }

    #[tokio::test]
    async fn ranked_output_carries_ranks_and_rounded_percents() {
        let m = model(vec![2.0, 5.0, 0.1, 5.0, 1.0], &["A1", "A3", "A4", "A5", "A6"]);
        let scores = InferenceEngine::new(1).run(&m, &image(), 3).await.unwrap();
        assert_eq!(scores.iter().map(|s| (s.rank, s.class_index)).collect::<Vec<_>>(), vec![(1, 1), (2, 3), (3, 0)]);
        assert_eq!(scores[0].label, "A3");
        assert_eq!(scores[0].confidence, scores[1].confidence);
        for s in &scores {
            assert_eq!(s.confidence_percent, (s.confidence * 100.0 * 100.0).round() / 100.0);
        }
        assert_eq!(scores[0].confidence_percent, 48.18);
        assert_eq!(scores[2].confidence_percent, 2.4);
    }

    #[tokio::test]
    async fn failed_forward_pass_is_unexpected_and_releases_permit() {
        let engine = InferenceEngine::new(1);
        let err = engine.run(&model(Vec::new(), &[]), &image(), 1).await.unwrap_err();
        assert!(matches!(err, ModelError::Unexpected(ref m) if m.contains("weights unavailable")), "{err}");
        assert_eq!(engine.available_permits(), 1);
    }

    #[test]
    fn ties_rank_by_ascending_index() {
        let mut probs = vec![2.0, 5.0, 0.1, 5.0, 1.0];
        softmax(&mut probs);
        let ranked = top_k(&probs, 3);
        assert_eq!(ranked.iter().map(|r| r.0).collect::<Vec<_>>(), vec![1, 3, 0]);
        assert_eq!(ranked[0].1, ranked[1].1);
    }

    #[test]
    fn k_is_capped_by_class_count() {
        assert_eq!(top_k(&[0.5, 0.5], 10).len(), 2);
        assert!(top_k(&[], 3).is_empty());
    }

    #[test]
    fn percent_rounds_to_two_decimals() {
        assert_eq!(percent(0.123456), 12.35);
        assert_eq!(percent(1.0), 100.0);
        assert_eq!(percent(0.0), 0.0);
    }

    #[test]
    fn top_k_bounds() {
        assert!(validate_top_k(1).is_ok());
        assert!(validate_top_k(10).is_ok());
        assert!(matches!(validate_top_k(0), Err(ModelError::InvalidRequest(_))));
        assert!(matches!(validate_top_k(11), Err(ModelError::InvalidRequest(_))));
    }

    #[test]
    fn batch_shape_is_normalized() {
        let dev = candle_core::Device::Cpu;
        let chw = Tensor::zeros((3, 8, 8), DType::F32, &dev).unwrap();
        assert_eq!(as_batch(&chw).unwrap().dims(), &[1, 3, 8, 8]);
        let nchw = Tensor::zeros((1, 3, 8, 8), DType::F64, &dev).unwrap();
        assert_eq!(as_batch(&nchw).unwrap().dtype(), DType::F32);
        let two = Tensor::zeros((2, 3, 8, 8), DType::F32, &dev).unwrap();
        assert!(matches!(as_batch(&two), Err(ModelError::InvalidRequest(_))));
    }
}
