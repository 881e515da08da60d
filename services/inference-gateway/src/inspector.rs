//! Infers network shape from checkpoint contents alone.
//!
//! Guessing the head width wrong does not degrade accuracy, it breaks weight
//! loading. The strict shape check in [`crate::network`] is what catches a bad
//! guess; this module never fails.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;

/// Final 1x1 projection of the backbone, `[features, in, 1, 1]`.
pub const FEATURE_PROJECTION_TENSOR: &str = "features.8.0.weight";
/// First linear layer of the head, `[hidden, features]`.
pub const HEAD_HIDDEN_TENSOR: &str = "classifier.1.weight";
/// Output linear layer of the head, `[classes, hidden]`.
pub const HEAD_OUTPUT_TENSOR: &str = "classifier.5.weight";

pub const DEFAULT_HIDDEN_SIZE: usize = 512;

/// Backbone variants this service can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Variant {
    /// EfficientNet-B0, 1280 output features.
    Small,
    /// EfficientNet-B3, 1536 output features.
    Large,
}

impl Variant {
    pub fn name(self) -> &'static str {
        match self {
            Self::Small => "efficientnet_b0",
            Self::Large => "efficientnet_b3",
        }
    }

    pub fn feature_width(self) -> usize {
        match self {
            Self::Small => 1280,
            Self::Large => 1536,
        }
    }

    pub fn from_feature_width(width: usize) -> Option<Self> {
        match width {
            1280 => Some(Self::Small),
            1536 => Some(Self::Large),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "efficientnet_b0" => Some(Self::Small),
            "efficientnet_b3" => Some(Self::Large),
            _ => None,
        }
    }
}

/// Architecture as recorded or detected. An explicit tag that names no known
/// variant is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Architecture {
    Known(Variant),
    Other(String),
}

impl Architecture {
    pub fn parse(name: &str) -> Self {
        Variant::from_name(name).map(Self::Known).unwrap_or_else(|| Self::Other(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Known(v) => v.name(),
            Self::Other(s) => s,
        }
    }

    pub fn variant(&self) -> Option<Variant> {
        match self {
            Self::Known(v) => Some(*v),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelDescriptor {
    pub architecture: Architecture,
    pub hidden_size: usize,
    pub num_classes: usize,
}

/// Detection rules plus the defaults used when a checkpoint says nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inspector {
    default_variant: Variant,
    default_hidden_size: usize,
}

impl Inspector {
    pub const fn new(default_variant: Variant, default_hidden_size: usize) -> Self {
        Self { default_variant, default_hidden_size }
    }

    /// The always-resident brand classifier was trained on the large backbone.
    pub const fn for_brand_classifier() -> Self { Self::new(Variant::Large, DEFAULT_HIDDEN_SIZE) }

    /// Per-brand model classifiers are mostly small-backbone checkpoints.
    pub const fn for_model_classifier() -> Self { Self::new(Variant::Small, DEFAULT_HIDDEN_SIZE) }

    pub fn default_variant(&self) -> Variant { self.default_variant }

    pub fn infer(&self, checkpoint: &Checkpoint) -> ModelDescriptor {
        let descriptor = ModelDescriptor {
            architecture: self.infer_architecture(checkpoint),
            hidden_size: self.infer_hidden_size(checkpoint),
            num_classes: infer_num_classes(checkpoint),
        };
        debug!(architecture=%descriptor.architecture, hidden=descriptor.hidden_size, classes=descriptor.num_classes, "checkpoint inspected");
        descriptor
    }

    pub fn infer_architecture(&self, checkpoint: &Checkpoint) -> Architecture {
        if let Some(tag) = &checkpoint.meta().architecture {
            return Architecture::parse(tag);
        }
        let detected = checkpoint
            .tensor_shape(FEATURE_PROJECTION_TENSOR)
            .and_then(|shape| shape.first().copied())
            .and_then(Variant::from_feature_width);
        match detected {
            Some(v) => Architecture::Known(v),
            None => {
                warn!(default=%self.default_variant.name(), "could not detect architecture, using default");
                Architecture::Known(self.default_variant)
            }
        }
    }

    pub fn infer_hidden_size(&self, checkpoint: &Checkpoint) -> usize {
        match checkpoint.tensor_shape(HEAD_HIDDEN_TENSOR).and_then(|s| s.first().copied()) {
            Some(hidden) => hidden,
            None => {
                warn!(default = self.default_hidden_size, "could not detect classifier hidden size, using default");
                self.default_hidden_size
            }
        }
    }

    /// Variant to build for `architecture`; unknown names use the default.
    pub fn buildable(&self, architecture: &Architecture) -> Variant {
        architecture.variant().unwrap_or_else(|| {
            warn!(architecture=%architecture, default=%self.default_variant.name(), "unknown architecture, building default");
            self.default_variant
        })
    }
}

/// Recorded class count, else the head's output width, else the class map size.
pub fn infer_num_classes(checkpoint: &Checkpoint) -> usize {
    if let Some(n) = checkpoint.meta().num_classes {
        return n;
    }
    if let Some(n) = checkpoint.tensor_shape(HEAD_OUTPUT_TENSOR).and_then(|s| s.first().copied()) {
        return n;
    }
    checkpoint.class_index().0.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointMeta;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    fn ckpt(shapes: &[(&str, &[usize])], meta: CheckpointMeta) -> Checkpoint {
        let tensors = shapes
            .iter()
            .map(|(name, shape)| (name.to_string(), Tensor::zeros(shape.to_vec(), DType::F32, &Device::Cpu).unwrap()))
            .collect::<HashMap<_, _>>();
        Checkpoint::new(tensors, meta)
    }

    #[test]
    fn feature_width_selects_variant() {
        let inspector = Inspector::for_model_classifier();
        let small = ckpt(&[(FEATURE_PROJECTION_TENSOR, &[1280, 320, 1, 1])], CheckpointMeta::default());
        let large = ckpt(&[(FEATURE_PROJECTION_TENSOR, &[1536, 384, 1, 1])], CheckpointMeta::default());
        let odd = ckpt(&[(FEATURE_PROJECTION_TENSOR, &[1792, 448, 1, 1])], CheckpointMeta::default());
        assert_eq!(inspector.infer_architecture(&small), Architecture::Known(Variant::Small));
        assert_eq!(inspector.infer_architecture(&large), Architecture::Known(Variant::Large));
        assert_eq!(inspector.infer_architecture(&odd), Architecture::Known(Variant::Small));
    }

    #[test]
    fn missing_projection_uses_stage_default() {
        let empty = ckpt(&[], CheckpointMeta::default());
        assert_eq!(Inspector::for_model_classifier().infer_architecture(&empty), Architecture::Known(Variant::Small));
        assert_eq!(Inspector::for_brand_classifier().infer_architecture(&empty), Architecture::Known(Variant::Large));
    }

    #[test]
    fn explicit_tag_is_trusted_verbatim() {
        let meta = CheckpointMeta { architecture: Some("efficientnet_b3".into()), ..Default::default() };
        let tagged = ckpt(&[(FEATURE_PROJECTION_TENSOR, &[1280, 320, 1, 1])], meta);
        assert_eq!(Inspector::for_model_classifier().infer_architecture(&tagged), Architecture::Known(Variant::Large));

        let meta = CheckpointMeta { architecture: Some("resnet50".into()), ..Default::default() };
        let other = ckpt(&[], meta);
        let inspector = Inspector::for_model_classifier();
        let arch = inspector.infer_architecture(&other);
        assert_eq!(arch, Architecture::Other("resnet50".into()));
        assert_eq!(inspector.buildable(&arch), Variant::Small);
    }

    #[test]
    fn hidden_size_comes_from_head() {
        let inspector = Inspector::for_model_classifier();
        let narrow = ckpt(&[(HEAD_HIDDEN_TENSOR, &[256, 1280])], CheckpointMeta::default());
        assert_eq!(inspector.infer_hidden_size(&narrow), 256);
        let bare = ckpt(&[], CheckpointMeta::default());
        assert_eq!(inspector.infer_hidden_size(&bare), 512);
    }

    #[test]
    fn num_classes_falls_back_through_head_then_map() {
        let recorded = ckpt(&[(HEAD_OUTPUT_TENSOR, &[7, 512])], CheckpointMeta { num_classes: Some(9), ..Default::default() });
        assert_eq!(infer_num_classes(&recorded), 9);
        let from_head = ckpt(&[(HEAD_OUTPUT_TENSOR, &[7, 512])], CheckpointMeta::default());
        assert_eq!(infer_num_classes(&from_head), 7);
        let meta = CheckpointMeta { class_to_idx: HashMap::from([("a".to_string(), 0), ("b".to_string(), 1)]), ..Default::default() };
        assert_eq!(infer_num_classes(&ckpt(&[], meta)), 2);
    }

    #[test]
    fn inference_is_deterministic() {
        let inspector = Inspector::for_model_classifier();
        let build = || ckpt(&[(FEATURE_PROJECTION_TENSOR, &[1536, 384, 1, 1]), (HEAD_HIDDEN_TENSOR, &[256, 1536]), (HEAD_OUTPUT_TENSOR, &[12, 256])], CheckpointMeta::default());
        let first = inspector.infer(&build());
        for _ in 0..5 {
            assert_eq!(inspector.infer(&build()), first);
        }
        assert_eq!(first, ModelDescriptor { architecture: Architecture::Known(Variant::Large), hidden_size: 256, num_classes: 12 });
    }
}
