use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
use opentelemetry::KeyValue;

static GATEWAY_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("carsight_inference"));

pub static CACHE_HITS: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_cache_hits_total").with_description("Model lookups served from memory").init());
pub static CACHE_MISSES: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_cache_misses_total").with_description("Model lookups that started or joined a load").init());
pub static LOADS_STARTED: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_model_loads_total").with_description("Model loads started").init());
pub static LOADS_FAILED: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_model_load_failures_total").with_description("Model loads that failed, by error kind").init());
pub static LOAD_LATENCY: Lazy<Histogram<f64>> = Lazy::new(|| GATEWAY_METER.f64_histogram("carsight_model_load_ms").with_description("Fetch + inspect + build latency (ms)").with_unit(Unit::new("ms")).init());
pub static EVICTIONS: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_evictions_total").with_description("Models evicted, by target").init());
pub static DOWNLOADS: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_downloads_total").with_description("Remote checkpoint downloads, by outcome").init());
pub static DOWNLOAD_BYTES: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_download_bytes_total").with_description("Bytes written by checkpoint downloads").init());
pub static INFERENCE_LATENCY: Lazy<Histogram<f64>> = Lazy::new(|| GATEWAY_METER.f64_histogram("carsight_inference_ms").with_description("Forward pass + ranking latency per stage (ms)").with_unit(Unit::new("ms")).init());
pub static UNKNOWN_INDICES: Lazy<Counter<u64>> = Lazy::new(|| GATEWAY_METER.u64_counter("carsight_unknown_class_index_total").with_description("Predictions whose class index had no name").init());

pub fn record_load_failure(kind: &'static str) {
    LOADS_FAILED.add(1, &[KeyValue::new("kind", kind)]);
}

pub fn record_eviction(target: &'static str, n: u64) {
    if n > 0 { EVICTIONS.add(n, &[KeyValue::new("target", target)]); }
}
