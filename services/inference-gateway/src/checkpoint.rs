//! Typed view of a serialized checkpoint.
//!
//! A checkpoint is a safetensors file. Training metadata lives in the
//! `__metadata__` string map:
//!
//! | key            | value                                  |
//! |----------------|----------------------------------------|
//! | `num_classes`  | integer                                |
//! | `best_val_acc` | float, percent                         |
//! | `architecture` | e.g. `efficientnet_b0` (optional)      |
//! | `brand_name`   | string (optional)                      |
//! | `class_to_idx` | JSON object, name → index              |
//! | `idx_to_model` | JSON object, index (as string) → name  |

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::warn;

use crate::error::{ModelError, Result};

pub const META_NUM_CLASSES: &str = "num_classes";
pub const META_BEST_VAL_ACC: &str = "best_val_acc";
pub const META_ARCHITECTURE: &str = "architecture";
pub const META_BRAND_NAME: &str = "brand_name";
pub const META_CLASS_TO_IDX: &str = "class_to_idx";
pub const META_IDX_TO_MODEL: &str = "idx_to_model";

/// Class index → human-readable name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassIndex {
    by_index: BTreeMap<usize, String>,
}

impl ClassIndex {
    pub fn new(by_index: BTreeMap<usize, String>) -> Self { Self { by_index } }

    /// Inverts `class_to_idx`. When several names share an index the
    /// alphabetically first one is kept.
    pub fn from_class_to_idx(class_to_idx: &HashMap<String, usize>) -> Self {
        let sorted: BTreeMap<&String, usize> = class_to_idx.iter().map(|(name, idx)| (name, *idx)).collect();
        let mut by_index: BTreeMap<usize, String> = BTreeMap::new();
        for (name, idx) in sorted {
            match by_index.get(&idx) {
                Some(kept) => warn!(index = idx, kept = %kept, dropped = %name, "class_to_idx maps several names to one index"),
                None => {
                    by_index.insert(idx, name.clone());
                }
            }
        }
        Self { by_index }
    }

    pub fn name(&self, index: usize) -> Option<&str> { self.by_index.get(&index).map(String::as_str) }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_index.iter().find(|(_, n)| n.as_str() == name).map(|(i, _)| *i)
    }

    /// The mapped name, or `Unknown_<index>` when the map has no entry.
    pub fn label(&self, index: usize) -> Cow<'_, str> {
        match self.name(index) {
            Some(n) => Cow::Borrowed(n),
            None => Cow::Owned(format!("Unknown_{index}")),
        }
    }

    pub fn len(&self) -> usize { self.by_index.len() }
    pub fn is_empty(&self) -> bool { self.by_index.is_empty() }
}

/// Which metadata field a [`ClassIndex`] was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    IdxToModel,
    ClassToIdx,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointMeta {
    pub num_classes: Option<usize>,
    pub best_val_acc: f64,
    pub architecture: Option<String>,
    pub brand_name: Option<String>,
    pub class_to_idx: HashMap<String, usize>,
    pub idx_to_model: BTreeMap<usize, String>,
}

impl CheckpointMeta {
    fn from_map(map: &HashMap<String, String>, origin: &Path) -> Result<Self> {
        let num_classes = map.get(META_NUM_CLASSES)
            .map(|v| v.trim().parse::<usize>().map_err(|e| ModelError::corrupt(origin, format!("num_classes '{v}': {e}"))))
            .transpose()?;
        let best_val_acc = map.get(META_BEST_VAL_ACC)
            .map(|v| v.trim().parse::<f64>().map_err(|e| ModelError::corrupt(origin, format!("best_val_acc '{v}': {e}"))))
            .transpose()?
            .unwrap_or(0.0);
        let class_to_idx = match map.get(META_CLASS_TO_IDX) {
            Some(raw) => serde_json::from_str::<HashMap<String, usize>>(raw)
                .map_err(|e| ModelError::corrupt(origin, format!("class_to_idx: {e}")))?,
            None => HashMap::new(),
        };
        let idx_to_model = match map.get(META_IDX_TO_MODEL) {
            Some(raw) => {
                let parsed = serde_json::from_str::<HashMap<String, String>>(raw)
                    .map_err(|e| ModelError::corrupt(origin, format!("idx_to_model: {e}")))?;
                let mut out = BTreeMap::new();
                for (k, v) in parsed {
                    match k.trim().parse::<usize>() {
                        Ok(i) => { out.insert(i, v); }
                        Err(_) => warn!(path=%origin.display(), key=%k, "skipping non-numeric idx_to_model key"),
                    }
                }
                out
            }
            None => BTreeMap::new(),
        };
        Ok(Self {
            num_classes,
            best_val_acc,
            architecture: map.get(META_ARCHITECTURE).filter(|s| !s.trim().is_empty()).cloned(),
            brand_name: map.get(META_BRAND_NAME).cloned(),
            class_to_idx,
            idx_to_model,
        })
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(n) = self.num_classes { map.insert(META_NUM_CLASSES.to_string(), n.to_string()); }
        map.insert(META_BEST_VAL_ACC.to_string(), self.best_val_acc.to_string());
        if let Some(a) = &self.architecture { map.insert(META_ARCHITECTURE.to_string(), a.clone()); }
        if let Some(b) = &self.brand_name { map.insert(META_BRAND_NAME.to_string(), b.clone()); }
        if !self.class_to_idx.is_empty() {
            map.insert(META_CLASS_TO_IDX.to_string(), serde_json::json!(self.class_to_idx).to_string());
        }
        if !self.idx_to_model.is_empty() {
            let keyed: HashMap<String, &String> = self.idx_to_model.iter().map(|(k, v)| (k.to_string(), v)).collect();
            map.insert(META_IDX_TO_MODEL.to_string(), serde_json::json!(keyed).to_string());
        }
        map
    }
}

/// Weights plus training metadata, read once per load.
#[derive(Debug)]
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
    meta: CheckpointMeta,
    path: Option<PathBuf>,
}

impl Checkpoint {
    pub fn new(tensors: HashMap<String, Tensor>, meta: CheckpointMeta) -> Self {
        Self { tensors, meta, path: None }
    }

    /// Memory-maps and parses a checkpoint file.
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| ModelError::corrupt(path, format!("open: {e}")))?;
        let len = file.metadata().map_err(|e| ModelError::corrupt(path, format!("stat: {e}")))?.len();
        if len == 0 { return Err(ModelError::corrupt(path, "empty file")); }
        // SAFETY: checkpoints are written once (download renames into place) and never mutated while mapped.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| ModelError::corrupt(path, format!("mmap: {e}")))?;
        let mut ckpt = Self::from_bytes(&mmap, device, path)?;
        ckpt.path = Some(path.to_path_buf());
        Ok(ckpt)
    }

    pub fn from_bytes(bytes: &[u8], device: &Device, origin: &Path) -> Result<Self> {
        let (_, header) = safetensors::SafeTensors::read_metadata(bytes)
            .map_err(|e| ModelError::corrupt(origin, format!("safetensors header: {e}")))?;
        let meta = match header.metadata() {
            Some(map) => CheckpointMeta::from_map(map, origin)?,
            None => CheckpointMeta::default(),
        };
        let tensors = candle_core::safetensors::load_buffer(bytes, device)
            .map_err(|e| ModelError::corrupt(origin, format!("tensor data: {e}")))?;
        Ok(Self { tensors, meta, path: None })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let data: Vec<(String, Tensor)> = self.tensors.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        safetensors::serialize_to_file(data, &Some(self.meta.to_map()), path)
            .map_err(|e| ModelError::Unexpected(format!("write {}: {e}", path.display())))
    }

    pub fn meta(&self) -> &CheckpointMeta { &self.meta }
    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }
    pub fn tensors(&self) -> &HashMap<String, Tensor> { &self.tensors }
    pub fn into_tensors(self) -> HashMap<String, Tensor> { self.tensors }

    pub fn tensor_shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.dims())
    }

    /// Prefers `idx_to_model`; otherwise inverts `class_to_idx`.
    pub fn class_index(&self) -> (ClassIndex, IndexOrigin) {
        if !self.meta.idx_to_model.is_empty() {
            return (ClassIndex::new(self.meta.idx_to_model.clone()), IndexOrigin::IdxToModel);
        }
        if !self.meta.class_to_idx.is_empty() {
            return (ClassIndex::from_class_to_idx(&self.meta.class_to_idx), IndexOrigin::ClassToIdx);
        }
        (ClassIndex::default(), IndexOrigin::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample() -> Checkpoint {
        let mut tensors = HashMap::new();
        tensors.insert("classifier.1.weight".to_string(), Tensor::zeros((256, 1280), DType::F32, &Device::Cpu).unwrap());
        let meta = CheckpointMeta {
            num_classes: Some(3),
            best_val_acc: 91.25,
            architecture: None,
            brand_name: Some("Audi".into()),
            class_to_idx: HashMap::from([("A3".to_string(), 0), ("A4".to_string(), 1), ("Q5".to_string(), 2)]),
            idx_to_model: BTreeMap::new(),
        };
        Checkpoint::new(tensors, meta)
    }

    #[test]
    fn write_then_read_keeps_metadata_and_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Audi_model.safetensors");
        sample().write(&path).unwrap();
        let back = Checkpoint::read(&path, &Device::Cpu).unwrap();
        assert_eq!(back.meta().num_classes, Some(3));
        assert_eq!(back.meta().best_val_acc, 91.25);
        assert_eq!(back.meta().brand_name.as_deref(), Some("Audi"));
        assert_eq!(back.tensor_shape("classifier.1.weight"), Some(&[256usize, 1280][..]));
        assert_eq!(back.path(), Some(path.as_path()));
    }

    #[test]
    fn idx_to_model_wins_over_class_to_idx() {
        let mut ck = sample();
        ck.meta.idx_to_model = BTreeMap::from([(0, "A3 Sportback".to_string())]);
        let (index, origin) = ck.class_index();
        assert_eq!(origin, IndexOrigin::IdxToModel);
        assert_eq!(index.name(0), Some("A3 Sportback"));
        assert_eq!(index.label(1), "Unknown_1");
    }

    #[test]
    fn class_to_idx_is_inverted_as_fallback() {
        let (index, origin) = sample().class_index();
        assert_eq!(origin, IndexOrigin::ClassToIdx);
        assert_eq!(index.name(2), Some("Q5"));
        assert_eq!(index.index_of("A4"), Some(1));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn shared_index_keeps_first_name_alphabetically() {
        let map = HashMap::from([("Q7".to_string(), 1), ("A3".to_string(), 0), ("Q5".to_string(), 1), ("Q3".to_string(), 1)]);
        for _ in 0..20 {
            let index = ClassIndex::from_class_to_idx(&map);
            assert_eq!(index.name(1), Some("Q3"));
            assert_eq!(index.name(0), Some("A3"));
            assert_eq!(index.len(), 2);
        }
    }

    #[test]
    fn empty_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        std::fs::write(&path, b"").unwrap();
        let err = Checkpoint::read(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, ModelError::CorruptArtifact { .. }));
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.safetensors");
        std::fs::write(&path, b"<html>quota exceeded</html>").unwrap();
        let err = Checkpoint::read(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, ModelError::CorruptArtifact { .. }), "{err:?}");
    }

    #[test]
    fn malformed_metadata_is_corrupt() {
        let map = HashMap::from([(META_NUM_CLASSES.to_string(), "many".to_string())]);
        let err = CheckpointMeta::from_map(&map, Path::new("x")).unwrap_err();
        assert!(err.to_string().contains("num_classes"));
    }
}
