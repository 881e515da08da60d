use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use carsight_core::{init_metrics, init_tracing, load_config, mark_ready, clear_ready, shutdown_metrics, start_health_server};
use carsight_resilience::RetryPolicy;
use inference_gateway::classifier::{ensure_brand_checkpoint, load_brand_model, ServiceSettings};
use inference_gateway::config::GatewayConfig;
use inference_gateway::store::parse_brand_map;
use inference_gateway::{CheckpointLoader, CheckpointStore, ClassifierService, HttpRemote, InferenceEngine, ModelCache};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    init_metrics()?;

    let cfg: GatewayConfig = load_config("inference-gateway").await?;
    let problems = cfg.validate();
    if !problems.is_empty() {
        for p in &problems { warn!(problem=%p, "invalid configuration"); }
        bail!("configuration rejected ({} problem(s))", problems.len());
    }
    info!(?cfg, "config loaded");

    start_health_server(cfg.health_port).await?;

    let remote = HttpRemote::new(cfg.store.remote_url_template.clone(), cfg.store.download_timeout())?;
    let remotes = parse_brand_map(&cfg.store.brand_model_ids).map_err(anyhow::Error::msg)?;
    if remotes.is_empty() {
        info!("no remote brand mapping, serving local checkpoints only");
    }
    let store = Arc::new(CheckpointStore::new(cfg.store.store_config(), remotes, Arc::new(remote.clone())));

    let policy = RetryPolicy::new(cfg.brand.bootstrap_attempts, Duration::from_secs(2));
    ensure_brand_checkpoint(&cfg.brand.model_path, cfg.brand.model_url.as_deref(), &remote, policy)
        .await
        .with_context(|| format!("brand checkpoint unavailable at {}", cfg.brand.model_path.display()))?;
    let brand_model = load_brand_model(&cfg.brand.model_path).await.context("brand classifier failed to load")?;

    let cache = ModelCache::new(Arc::new(CheckpointLoader::new(store.clone())), store);
    let engine = InferenceEngine::new(cfg.inference.max_concurrent);
    let settings = ServiceSettings { auto_cleanup: cfg.inference.auto_cleanup, request_timeout: cfg.inference.request_timeout() };
    let service = ClassifierService::new(brand_model, cache, engine, settings);
    info!(info=?service.info(), "classifier ready");
    mark_ready();

    signal::ctrl_c().await?;
    clear_ready();
    info!(resident = service.cache().loaded_brands().len(), "shutdown");
    shutdown_metrics();
    Ok(())
}
