//! Two-stage vehicle classifier with an on-demand per-brand model cache.
//!
//! A resident brand classifier picks the brand; the brand's model classifier
//! is resolved through [`cache::ModelCache`], which fetches checkpoints from
//! disk or the remote store, infers their architecture, builds the network
//! strictly and keeps it in memory until evicted.

pub mod cache;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod efficientnet;
pub mod error;
pub mod inference;
pub mod inspector;
pub mod loader;
pub mod lookup;
pub mod metrics;
pub mod network;
pub mod store;

pub use cache::{CacheSnapshot, EvictionCounts, ModelCache};
pub use classifier::{Classification, ClassifierService};
pub use error::{ModelError, Result};
pub use inference::{BrandPrediction, InferenceEngine, Prediction};
pub use loader::{CheckpointLoader, LoadedModel, ModelLoader};
pub use store::{CheckpointStore, HttpRemote, RemoteSource};
