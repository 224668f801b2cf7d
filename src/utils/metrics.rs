//! Prometheus metrics for training observability.
//!
//! Tracks loss, throughput, learning rate and validation error.

use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all training metrics.
pub struct MetricsRegistry {
    pub registry: Registry,

    pub training_loss: Histogram,
    pub batches_completed: Counter,
    pub epochs_completed: Counter,

    pub samples_per_second: Gauge,
    pub learning_rate: Gauge,

    pub val_err_top1: Gauge,
    pub val_err_top5: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let training_loss = Histogram::with_opts(
            HistogramOpts::new("imagenet_training_loss", "Training loss value")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 7.0, 10.0]),
        )
        .unwrap();
        registry.register(Box::new(training_loss.clone())).unwrap();

        let batches_completed = Counter::with_opts(Opts::new(
            "imagenet_batches_completed_total",
            "Total training batches completed",
        ))
        .unwrap();
        registry
            .register(Box::new(batches_completed.clone()))
            .unwrap();

        let epochs_completed = Counter::with_opts(Opts::new(
            "imagenet_epochs_completed_total",
            "Total training epochs completed",
        ))
        .unwrap();
        registry
            .register(Box::new(epochs_completed.clone()))
            .unwrap();

        let samples_per_second = Gauge::with_opts(Opts::new(
            "imagenet_samples_per_second",
            "Current samples/second throughput",
        ))
        .unwrap();
        registry
            .register(Box::new(samples_per_second.clone()))
            .unwrap();

        let learning_rate = Gauge::with_opts(Opts::new(
            "imagenet_learning_rate",
            "Current learning rate",
        ))
        .unwrap();
        registry.register(Box::new(learning_rate.clone())).unwrap();

        let val_err_top1 = Gauge::with_opts(Opts::new(
            "imagenet_val_err_top1",
            "Validation top-1 error of the last evaluation",
        ))
        .unwrap();
        registry.register(Box::new(val_err_top1.clone())).unwrap();

        let val_err_top5 = Gauge::with_opts(Opts::new(
            "imagenet_val_err_top5",
            "Validation top-5 error of the last evaluation",
        ))
        .unwrap();
        registry.register(Box::new(val_err_top5.clone())).unwrap();

        Self {
            registry,
            training_loss,
            batches_completed,
            epochs_completed,
            samples_per_second,
            learning_rate,
            val_err_top1,
            val_err_top5,
        }
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the process-wide metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

/// Record one logging interval of training.
pub fn record_interval(loss: f64, samples_per_sec: f64, lr: f64, batches: u64) {
    let m = get_metrics();
    m.training_loss.observe(loss);
    m.samples_per_second.set(samples_per_sec);
    m.learning_rate.set(lr);
    m.batches_completed.inc_by(batches as f64);
}

/// Record the result of one validation pass.
pub fn record_validation(err_top1: f64, err_top5: f64) {
    let m = get_metrics();
    m.val_err_top1.set(err_top1);
    m.val_err_top5.set(err_top5);
    m.epochs_completed.inc();
}

/// Serve the registry over HTTP for scraping.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing::info;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = get_metrics().gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}
