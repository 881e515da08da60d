use std::collections::HashMap;
use std::fmt::Write as _;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::efficientnet::{BackboneConfig, EfficientNet, HeadShape, Manifest};
use crate::error::{ModelError, Result};
use crate::inspector::{ModelDescriptor, Variant};

const BATCH_COUNTER_SUFFIX: &str = ".num_batches_tracked";
const MAX_LISTED: usize = 8;

/// A weight-populated network ready for forward passes. Forward passes never
/// mutate the network, so one instance serves concurrent requests.
pub trait ImageClassifier: Send + Sync + std::fmt::Debug {
    /// `[N, 3, H, W]` → logits `[N, classes]`.
    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor>;
}

impl ImageClassifier for EfficientNet {
    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> { Module::forward(self, images) }
}

/// The exact parameter manifest for one descriptor, and the strict loader
/// that checks a checkpoint against it before building anything.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    variant: Variant,
    backbone: BackboneConfig,
    head: HeadShape,
    manifest: Manifest,
}

impl NetworkPlan {
    pub fn new(descriptor: &ModelDescriptor, variant: Variant) -> Self {
        let backbone = BackboneConfig::for_variant(variant);
        let head = HeadShape { features: backbone.features, hidden: descriptor.hidden_size, classes: descriptor.num_classes };
        let mut manifest = Manifest::new();
        backbone.manifest(&mut manifest);
        head.manifest(&mut manifest);
        Self { variant, backbone, head, manifest }
    }

    pub fn variant(&self) -> Variant { self.variant }
    pub fn head(&self) -> HeadShape { self.head }
    pub fn manifest(&self) -> &Manifest { &self.manifest }

    /// Fails unless every expected tensor is present with the expected shape
    /// and nothing else is. Scalar batch-norm step counters are tolerated.
    pub fn verify(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let mut missing: Vec<&str> = self.manifest.keys().filter(|k| !tensors.contains_key(*k)).map(String::as_str).collect();
        let mut unexpected: Vec<&str> = tensors
            .iter()
            .filter(|(name, t)| !self.manifest.contains_key(*name) && !self.is_batch_counter(name, t))
            .map(|(name, _)| name.as_str())
            .collect();
        let mut mismatched: Vec<(&str, &[usize], &[usize])> = self
            .manifest
            .iter()
            .filter_map(|(name, want)| {
                let got = tensors.get(name)?.dims();
                (got != want.as_slice()).then_some((name.as_str(), got, want.as_slice()))
            })
            .collect();
        if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
            debug!(variant=%self.variant.name(), tensors=self.manifest.len(), "checkpoint matches network");
            return Ok(());
        }
        missing.sort_unstable();
        unexpected.sort_unstable();
        mismatched.sort_unstable_by_key(|m| m.0);

        let mut msg = format!("checkpoint does not fit {} (hidden {}, classes {})", self.variant.name(), self.head.hidden, self.head.classes);
        if !missing.is_empty() {
            let _ = write!(msg, "; missing {} key(s): {}", missing.len(), listed(&missing));
        }
        if !unexpected.is_empty() {
            let _ = write!(msg, "; unexpected {} key(s): {}", unexpected.len(), listed(&unexpected));
        }
        for (name, got, want) in mismatched.iter().take(MAX_LISTED) {
            let _ = write!(msg, "; size mismatch for {name}: checkpoint {got:?}, network {want:?}");
        }
        Err(ModelError::ShapeMismatch(msg))
    }

    fn is_batch_counter(&self, name: &str, tensor: &Tensor) -> bool {
        name.strip_suffix(BATCH_COUNTER_SUFFIX)
            .is_some_and(|prefix| self.manifest.contains_key(&format!("{prefix}.running_mean")))
            && tensor.elem_count() == 1
    }

    /// Strictly verifies `tensors`, then instantiates the network from them.
    pub fn build(&self, tensors: HashMap<String, Tensor>, device: &Device) -> Result<Box<dyn ImageClassifier>> {
        self.verify(&tensors)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let net = EfficientNet::load(&self.backbone, self.head, vb)?;
        Ok(Box::new(net))
    }
}

fn listed(names: &[&str]) -> String {
    let mut out = names.iter().take(MAX_LISTED).copied().collect::<Vec<_>>().join(", ");
    if names.len() > MAX_LISTED {
        let _ = write!(out, ", ... (+{})", names.len() - MAX_LISTED);
    }
    out
}

/// Zero-valued tensors (unit batch-norm variance) matching `plan`. Used to
/// materialize synthetic checkpoints.
pub fn zero_weights(plan: &NetworkPlan, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(plan.manifest.len());
    for (name, shape) in &plan.manifest {
        let t = if name.ends_with(".running_var") {
            Tensor::ones(shape.as_slice(), DType::F32, device)?
        } else {
            Tensor::zeros(shape.as_slice(), DType::F32, device)?
        };
        out.insert(name.clone(), t);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::Architecture;

    fn descriptor(hidden: usize, classes: usize) -> ModelDescriptor {
        ModelDescriptor { architecture: Architecture::Known(Variant::Small), hidden_size: hidden, num_classes: classes }
    }

    #[test]
    fn manifest_ends_with_configured_head() {
        let plan = NetworkPlan::new(&descriptor(256, 4), Variant::Small);
        assert_eq!(plan.manifest()["classifier.1.weight"], vec![256, 1280]);
        assert_eq!(plan.manifest()["classifier.5.weight"], vec![4, 256]);
        let large = NetworkPlan::new(&descriptor(512, 4), Variant::Large);
        assert_eq!(large.manifest()["classifier.1.weight"], vec![512, 1536]);
    }

    #[test]
    fn zero_weights_pass_verification() {
        let plan = NetworkPlan::new(&descriptor(16, 3), Variant::Small);
        let mut weights = zero_weights(&plan, &Device::Cpu).unwrap();
        weights.insert("classifier.3.num_batches_tracked".into(), Tensor::new(0i64, &Device::Cpu).unwrap());
        plan.verify(&weights).unwrap();
    }

    #[test]
    fn wrong_hidden_size_is_shape_mismatch() {
        let trained = NetworkPlan::new(&descriptor(256, 3), Variant::Small);
        let weights = zero_weights(&trained, &Device::Cpu).unwrap();
        let guessed = NetworkPlan::new(&descriptor(512, 3), Variant::Small);
        let err = guessed.verify(&weights).unwrap_err();
        match err {
            ModelError::ShapeMismatch(msg) => assert!(msg.contains("classifier.1.weight"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_and_extra_tensors_are_rejected() {
        let plan = NetworkPlan::new(&descriptor(16, 3), Variant::Small);
        let mut weights = zero_weights(&plan, &Device::Cpu).unwrap();
        weights.remove("classifier.5.bias");
        let err = plan.verify(&weights).unwrap_err().to_string();
        assert!(err.contains("missing 1 key(s): classifier.5.bias"), "{err}");

        let mut weights = zero_weights(&plan, &Device::Cpu).unwrap();
        weights.insert("fc.weight".into(), Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap());
        let err = plan.verify(&weights).unwrap_err().to_string();
        assert!(err.contains("unexpected 1 key(s): fc.weight"), "{err}");
    }

    #[test]
    fn small_backbone_checkpoint_does_not_fit_large_plan() {
        let small = NetworkPlan::new(&descriptor(16, 3), Variant::Small);
        let weights = zero_weights(&small, &Device::Cpu).unwrap();
        let large = NetworkPlan::new(&descriptor(16, 3), Variant::Large);
        assert!(matches!(large.verify(&weights), Err(ModelError::ShapeMismatch(_))));
    }

    #[test]
    fn built_network_produces_logits_per_class() {
        let plan = NetworkPlan::new(&descriptor(8, 5), Variant::Small);
        let weights = zero_weights(&plan, &Device::Cpu).unwrap();
        let net = plan.build(weights, &Device::Cpu).unwrap();
        let input = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let logits = net.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[2, 5]);
    }
}
