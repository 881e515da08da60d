#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use inference_gateway::checkpoint::{Checkpoint, CheckpointMeta, ClassIndex};
use inference_gateway::inspector::{Architecture, ModelDescriptor, Variant};
use inference_gateway::network::{zero_weights, ImageClassifier, NetworkPlan};
use inference_gateway::store::{CheckpointStore, RemoteEntry, RemoteSource, StoreConfig};
use inference_gateway::{LoadedModel, ModelError, ModelLoader, Result};
use tokio::sync::Semaphore;

pub const EXT: &str = "safetensors";
pub const TAG: &str = "efficientnet_b3";

pub struct NoRemote;

#[async_trait]
impl RemoteSource for NoRemote {
    async fn download(&self, brand: &str, _entry: &RemoteEntry, _dest: &Path) -> Result<u64> {
        Err(ModelError::download(brand, "offline"))
    }
}

pub fn local_store(root: &Path) -> Arc<CheckpointStore> {
    let cfg = StoreConfig { models_dir: root.join("car_models"), legacy_dir: None, extension: EXT.into(), architecture_tag: TAG.into() };
    Arc::new(CheckpointStore::new(cfg, HashMap::new(), Arc::new(NoRemote)))
}

pub fn put_file(root: &Path, name: &str, bytes: usize) {
    let dir = root.join("car_models");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), vec![0u8; bytes]).unwrap();
}

#[derive(Debug)]
pub struct FixedLogits(pub Vec<f32>);

impl ImageClassifier for FixedLogits {
    fn forward(&self, _images: &Tensor) -> candle_core::Result<Tensor> {
        Tensor::new(self.0.as_slice(), &Device::Cpu)?.unsqueeze(0)
    }
}

pub fn fake_model(brand: &str, logits: Vec<f32>, names: &[&str]) -> LoadedModel {
    let n = logits.len();
    LoadedModel {
        brand: brand.to_string(),
        network: Box::new(FixedLogits(logits)),
        class_index: ClassIndex::new(names.iter().enumerate().map(|(i, s)| (i, s.to_string())).collect()),
        descriptor: ModelDescriptor { architecture: Architecture::Known(Variant::Small), hidden_size: 512, num_classes: n },
        best_val_acc: 88.0,
        source: format!("{brand}.{EXT}").into(),
    }
}

/// Counts loads; each load waits for one permit on `gate`. The first
/// `failures` loads fail with a retryable error.
pub struct GatedLoader {
    pub calls: AtomicUsize,
    pub gate: Semaphore,
    failures: AtomicUsize,
}

impl GatedLoader {
    pub fn new(permits: usize, failures: usize) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), gate: Semaphore::new(permits), failures: AtomicUsize::new(failures) })
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl ModelLoader for GatedLoader {
    async fn load(&self, brand: &str) -> Result<LoadedModel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.map_err(|_| ModelError::Unexpected("gate closed".into()))?.forget();
        let fail = self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if fail {
            return Err(ModelError::download(brand, "connection reset"));
        }
        Ok(fake_model(brand, vec![0.1, 2.0, 0.3], &["A", "B", "C"]))
    }
}

/// Reads nothing but requires the checkpoint to be present, like the real
/// loader's store fetch.
pub struct DiskLoader {
    pub store: Arc<CheckpointStore>,
}

#[async_trait]
impl ModelLoader for DiskLoader {
    async fn load(&self, brand: &str) -> Result<LoadedModel> {
        let fetched = self.store.fetch(brand).await?;
        let mut model = fake_model(brand, vec![1.0, 0.0], &["X", "Y"]);
        model.source = fetched.path;
        Ok(model)
    }
}

/// Waits until `cond` holds, polling every few milliseconds for up to 5s.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub enum Names<'a> {
    IdxToModel(&'a [&'a str]),
    ClassToIdx(&'a [&'a str]),
}

/// Writes a zero-weight checkpoint whose head matches `hidden` and the class
/// names. Zero weights make every logit equal.
pub fn write_checkpoint(path: &Path, variant: Variant, hidden: usize, names: Names<'_>) {
    let list = match &names {
        Names::IdxToModel(n) | Names::ClassToIdx(n) => *n,
    };
    let descriptor = ModelDescriptor { architecture: Architecture::Known(variant), hidden_size: hidden, num_classes: list.len() };
    let plan = NetworkPlan::new(&descriptor, variant);
    let tensors = zero_weights(&plan, &Device::Cpu).unwrap();
    let mut meta = CheckpointMeta { num_classes: Some(list.len()), best_val_acc: 90.5, ..Default::default() };
    match names {
        Names::IdxToModel(n) => meta.idx_to_model = n.iter().enumerate().map(|(i, s)| (i, s.to_string())).collect::<BTreeMap<_, _>>(),
        Names::ClassToIdx(n) => meta.class_to_idx = n.iter().enumerate().map(|(i, s)| (s.to_string(), i)).collect(),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    Checkpoint::new(tensors, meta).write(path).unwrap();
}
