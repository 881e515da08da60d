use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::Device;
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, ClassIndex, IndexOrigin};
use crate::error::Result;
use crate::inspector::{Inspector, ModelDescriptor};
use crate::network::{ImageClassifier, NetworkPlan};
use crate::store::CheckpointStore;

/// Which classifier a checkpoint feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Brand,
    Model,
}

impl Stage {
    pub fn inspector(self) -> Inspector {
        match self {
            Self::Brand => Inspector::for_brand_classifier(),
            Self::Model => Inspector::for_model_classifier(),
        }
    }

    /// Model checkpoints are expected to carry `idx_to_model`; brand
    /// checkpoints only ever shipped `class_to_idx`.
    fn expects_idx_to_model(self) -> bool { matches!(self, Self::Model) }
}

/// A weight-populated network with everything needed to label its output.
#[derive(Debug)]
pub struct LoadedModel {
    pub brand: String,
    pub network: Box<dyn ImageClassifier>,
    pub class_index: ClassIndex,
    pub descriptor: ModelDescriptor,
    pub best_val_acc: f64,
    pub source: PathBuf,
}

/// Produces a [`LoadedModel`] for a brand. The cache only sees this seam.
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    async fn load(&self, brand: &str) -> Result<LoadedModel>;
}

/// Store fetch, then read + inspect + build on the blocking pool.
#[derive(Debug)]
pub struct CheckpointLoader {
    store: Arc<CheckpointStore>,
    device: Device,
}

impl CheckpointLoader {
    pub fn new(store: Arc<CheckpointStore>) -> Self { Self { store, device: Device::Cpu } }

    pub fn store(&self) -> &Arc<CheckpointStore> { &self.store }
}

#[async_trait]
impl ModelLoader for CheckpointLoader {
    async fn load(&self, brand: &str) -> Result<LoadedModel> {
        let fetched = self.store.fetch(brand).await?;
        let brand = brand.to_string();
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || load_from_path(&brand, &fetched.path, Stage::Model, &device)).await?
    }
}

/// Reads, inspects and strictly builds the checkpoint at `path`.
pub fn load_from_path(brand: &str, path: &Path, stage: Stage, device: &Device) -> Result<LoadedModel> {
    let checkpoint = Checkpoint::read(path, device)?;
    let inspector = stage.inspector();
    let descriptor = inspector.infer(&checkpoint);
    let (class_index, origin) = checkpoint.class_index();
    match origin {
        IndexOrigin::IdxToModel => {}
        IndexOrigin::ClassToIdx if !stage.expects_idx_to_model() => {}
        IndexOrigin::ClassToIdx => warn!(brand, path=%path.display(), "idx_to_model missing, inverting class_to_idx"),
        IndexOrigin::Missing => warn!(brand, path=%path.display(), "checkpoint carries no class names"),
    }
    let plan = NetworkPlan::new(&descriptor, inspector.buildable(&descriptor.architecture));
    let best_val_acc = checkpoint.meta().best_val_acc;
    let network = plan.build(checkpoint.into_tensors(), device)?;
    info!(
        brand,
        ?stage,
        architecture=%descriptor.architecture,
        hidden=descriptor.hidden_size,
        classes=descriptor.num_classes,
        accuracy=best_val_acc,
        "model ready"
    );
    Ok(LoadedModel { brand: brand.to_string(), network, class_index, descriptor, best_val_acc, source: path.to_path_buf() })
}
