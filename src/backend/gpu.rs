//! Accelerator metrics parsing.
//!
//! The engine host is queried over the tunnel with
//! `nvidia-smi --query-gpu=utilization.gpu,temperature.gpu --format=csv,noheader,nounits`,
//! which prints one `util, temp` line per GPU.

/// The query run on the engine host to harvest per-GPU metrics.
pub const NVIDIA_SMI_QUERY: &str =
    "nvidia-smi --query-gpu=utilization.gpu,temperature.gpu --format=csv,noheader,nounits 2>/dev/null";

/// Parsed metrics for a single GPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuMetric {
    pub utilization: f64,
    pub temperature: f64,
}

/// Parsed metrics for all GPUs on an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuMetrics {
    pub gpus: Vec<GpuMetric>,
}

impl GpuMetrics {
    /// Mean utilization across all GPUs.
    pub fn avg_utilization(&self) -> f64 {
        if self.gpus.is_empty() {
            return 0.0;
        }
        self.gpus.iter().map(|g| g.utilization).sum::<f64>() / self.gpus.len() as f64
    }

    /// Mean temperature across all GPUs.
    pub fn avg_temperature(&self) -> f64 {
        if self.gpus.is_empty() {
            return 0.0;
        }
        self.gpus.iter().map(|g| g.temperature).sum::<f64>() / self.gpus.len() as f64
    }
}

/// Errors from parsing `nvidia-smi` output.
#[derive(Debug, thiserror::Error)]
pub enum GpuParseError {
    #[error("empty nvidia-smi output")]
    Empty,

    #[error("unexpected nvidia-smi format: {0:?}")]
    Format(String),

    #[error("parse {field} in {line:?}")]
    Number { field: &'static str, line: String },
}

/// Parse `nvidia-smi` CSV output, one `util, temp` line per GPU.
pub fn parse_nvidia_smi(output: &str) -> Result<GpuMetrics, GpuParseError> {
    let output = output.trim();
    if output.is_empty() {
        return Err(GpuParseError::Empty);
    }

    let mut gpus = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((util, temp)) = line.split_once(',') else {
            return Err(GpuParseError::Format(line.to_string()));
        };
        let utilization = util.trim().parse().map_err(|_| GpuParseError::Number {
            field: "utilization",
            line: line.to_string(),
        })?;
        let temperature = temp.trim().parse().map_err(|_| GpuParseError::Number {
            field: "temperature",
            line: line.to_string(),
        })?;
        gpus.push(GpuMetric {
            utilization,
            temperature,
        });
    }

    if gpus.is_empty() {
        return Err(GpuParseError::Empty);
    }
    Ok(GpuMetrics { gpus })
}

/// Per-instance metrics update published on the metrics sink.
#[derive(Debug, Clone)]
pub struct GpuUpdate {
    pub instance_id: u64,
    pub gpus: Vec<GpuMetric>,
}
