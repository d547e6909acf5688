//! 模拟计算后端
//!
//! 支持 `run_simulation`（DESI / Bell / AI / Tree）、`compute_eigenvalues` 与 `operator_visualization`
//! （算子 harmonic / position / momentum）。谱均由解析式给出，计算按块进行，每块之间检查取消信号并让出调度。
//! 可视化只返回绘图所需的数据（前 20 个特征值与直方图），不渲染图片。

use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendHealth, ComputationBackend};
use crate::config::SimulationSection;
use crate::core::TaskType;

pub const RUN_SIMULATION: &str = "run_simulation";
pub const COMPUTE_EIGENVALUES: &str = "compute_eigenvalues";
pub const OPERATOR_VISUALIZATION: &str = "operator_visualization";

/// 可视化返回的特征值个数与直方图分箱数
const PREVIEW_LEN: usize = 20;
const HISTOGRAM_BINS: usize = 20;

/// 每块计算的维度数
const CHUNK: usize = 256;
/// 连续失败达到该次数后自报不健康
const UNHEALTHY_AFTER_FAILURES: usize = 3;

#[derive(Debug, Deserialize)]
struct SimulationPayload {
    #[serde(default = "default_simulation_type")]
    simulation_type: String,
    #[serde(default = "default_dimensions")]
    n_dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct OperatorPayload {
    #[serde(default = "default_operator_type")]
    operator_type: String,
    #[serde(default = "default_dimensions")]
    n_dimensions: usize,
}

fn default_simulation_type() -> String {
    "DESI".to_string()
}

fn default_operator_type() -> String {
    "harmonic".to_string()
}

fn default_dimensions() -> usize {
    100
}

/// 模拟后端
#[derive(Debug)]
pub struct SimulationBackend {
    latency: Duration,
    max_dimensions: usize,
    consecutive_failures: AtomicUsize,
}

impl SimulationBackend {
    pub fn new(latency: Duration, max_dimensions: usize) -> Self {
        Self {
            latency,
            max_dimensions,
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    pub fn from_config(section: &SimulationSection) -> Self {
        Self::new(Duration::from_millis(section.latency_ms), section.max_dimensions)
    }

    fn check_dimensions(&self, n: usize) -> Result<(), BackendError> {
        if n == 0 || n > self.max_dimensions {
            return Err(BackendError::Failed(format!(
                "n_dimensions must be in 1..={}, got {n}",
                self.max_dimensions
            )));
        }
        Ok(())
    }

    async fn run(&self, task_type: &TaskType, payload: Value, cancel: &CancellationToken) -> Result<Value, BackendError> {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        match task_type.as_str() {
            RUN_SIMULATION => {
                let p: SimulationPayload = parse_payload(payload)?;
                self.check_dimensions(p.n_dimensions)?;
                let n = p.n_dimensions;
                let (eigenvalues, metadata) = match p.simulation_type.as_str() {
                    "DESI" => (
                        spectrum(n, cancel, |k| position_eigenvalue(k, n)).await?,
                        json!({ "type": "DESI", "dimensions": n }),
                    ),
                    "Tree" => (
                        spectrum(n, cancel, |k| 2.0 - 2.0 * (PI * k as f64 / n as f64).cos()).await?,
                        json!({ "type": "Tree", "nodes": n, "edges": n - 1 }),
                    ),
                    "Bell" => {
                        let eigenvalues = bell_spectrum(n, cancel).await?;
                        (eigenvalues, json!({ "type": "Bell", "violations": 1.0 }))
                    }
                    // 两层 n→n 全连接网络的 WWᵀ 谱：奇异值按 1/(k+1) 衰减
                    "AI" => (
                        spectrum(n, cancel, |k| (1.0 / (k + 1) as f64).powi(2)).await?,
                        json!({ "type": "AI", "network_params": 2 * (n * n + n) }),
                    ),
                    other => {
                        return Err(BackendError::Failed(format!("unknown simulation type: {other}")));
                    }
                };
                Ok(json!({
                    "simulation_type": p.simulation_type,
                    "eigenvalues": spectrum_sorted(eigenvalues),
                    "metadata": metadata,
                }))
            }
            COMPUTE_EIGENVALUES => {
                let p: OperatorPayload = parse_payload(payload)?;
                self.check_dimensions(p.n_dimensions)?;
                let n = p.n_dimensions;
                let eigenvalues = operator_spectrum(&p.operator_type, n, cancel).await?;
                Ok(json!({
                    "operator_type": p.operator_type,
                    "matrix_shape": [n, n],
                    "eigenvalues": eigenvalues,
                }))
            }
            OPERATOR_VISUALIZATION => {
                let p: OperatorPayload = parse_payload(payload)?;
                self.check_dimensions(p.n_dimensions)?;
                let n = p.n_dimensions;
                let eigenvalues = operator_spectrum(&p.operator_type, n, cancel).await?;
                Ok(json!({
                    "operator_type": p.operator_type,
                    "matrix_shape": [n, n],
                    "eigenvalues": &eigenvalues[..eigenvalues.len().min(PREVIEW_LEN)],
                    "histogram": histogram(&eigenvalues, HISTOGRAM_BINS),
                }))
            }
            other => Err(BackendError::Unsupported(other.to_string())),
        }
    }
}

impl Default for SimulationBackend {
    fn default() -> Self {
        Self::from_config(&SimulationSection::default())
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, BackendError> {
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload).map_err(|e| BackendError::Failed(format!("invalid payload: {e}")))
}

fn position_eigenvalue(k: usize, n: usize) -> f64 {
    if n == 1 {
        return -10.0;
    }
    -10.0 + 20.0 * k as f64 / (n - 1) as f64
}

/// 算子谱（升序）
async fn operator_spectrum(operator_type: &str, n: usize, cancel: &CancellationToken) -> Result<Vec<f64>, BackendError> {
    let eigenvalues = match operator_type {
        "harmonic" => spectrum(n, cancel, |k| (k + 1) as f64).await?,
        "position" => spectrum(n, cancel, |k| position_eigenvalue(k, n)).await?,
        // 反对称三对角矩阵：特征值为 ±2i·cos(kπ/(n+1))，这里返回模长
        "momentum" => spectrum(n, cancel, |k| (2.0 * (PI * (k + 1) as f64 / (n + 1) as f64).cos()).abs()).await?,
        other => {
            return Err(BackendError::Failed(format!("unknown operator type: {other}")));
        }
    };
    Ok(spectrum_sorted(eigenvalues))
}

/// 等宽分箱；所有值相同时全部落入第一个箱
fn histogram(values: &[f64], bins: usize) -> Value {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in values {
        let idx = if width > 0.0 {
            (((v - min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        counts[idx] += 1;
    }
    let edges: Vec<f64> = (0..=bins).map(|i| min + width * i as f64).collect();
    json!({ "counts": counts, "edges": edges })
}

fn spectrum_sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// 按块生成 n 个特征值，块间检查取消
async fn spectrum<F>(n: usize, cancel: &CancellationToken, f: F) -> Result<Vec<f64>, BackendError>
where
    F: Fn(usize) -> f64,
{
    let mut values = Vec::with_capacity(n);
    for start in (0..n).step_by(CHUNK) {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        values.extend((start..(start + CHUNK).min(n)).map(&f));
        tokio::task::yield_now().await;
    }
    Ok(values)
}

/// Bell 关联矩阵 -cos(2(θi-θj)) = -(uuᵀ + vvᵀ)，秩不超过 2；非零特征值由 2×2 Gram 矩阵给出
async fn bell_spectrum(n: usize, cancel: &CancellationToken) -> Result<Vec<f64>, BackendError> {
    let mut uu = 0.0;
    let mut vv = 0.0;
    let mut uv = 0.0;
    for start in (0..n).step_by(CHUNK) {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        for i in start..(start + CHUNK).min(n) {
            let angle = if n == 1 { 0.0 } else { 2.0 * PI * i as f64 / (n - 1) as f64 };
            let (s, c) = (2.0 * angle).sin_cos();
            uu += c * c;
            vv += s * s;
            uv += c * s;
        }
        tokio::task::yield_now().await;
    }
    let trace = uu + vv;
    let det = uu * vv - uv * uv;
    let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
    let mut values = vec![0.0; n.saturating_sub(2)];
    values.push(-(trace / 2.0 + disc));
    if n >= 2 {
        values.push(-(trace / 2.0 - disc));
    }
    Ok(values)
}

#[async_trait]
impl ComputationBackend for SimulationBackend {
    fn name(&self) -> &str {
        "simulation"
    }

    fn supports(&self, task_type: &TaskType) -> bool {
        matches!(
            task_type.as_str(),
            RUN_SIMULATION | COMPUTE_EIGENVALUES | OPERATOR_VISUALIZATION
        )
    }

    fn required_permissions(&self, task_type: &TaskType) -> Vec<String> {
        match task_type.as_str() {
            RUN_SIMULATION => vec!["simulation".to_string()],
            COMPUTE_EIGENVALUES | OPERATOR_VISUALIZATION => vec!["compute".to_string()],
            _ => Vec::new(),
        }
    }

    async fn execute(
        &self,
        task_type: &TaskType,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BackendError> {
        let result = self.run(task_type, payload, &cancel).await;
        match &result {
            Ok(_) | Err(BackendError::Cancelled) => self.consecutive_failures.store(0, Ordering::Relaxed),
            Err(_) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn health_status(&self) -> BackendHealth {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures >= UNHEALTHY_AFTER_FAILURES {
            BackendHealth::unhealthy(format!("{failures} consecutive simulation failures"))
        } else {
            BackendHealth::healthy()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SimulationBackend {
        SimulationBackend::new(Duration::ZERO, 1024)
    }

    async fn exec(b: &SimulationBackend, task_type: &str, payload: Value) -> Result<Value, BackendError> {
        b.execute(&TaskType::new(task_type), payload, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_harmonic_spectrum() {
        let out = exec(&backend(), COMPUTE_EIGENVALUES, json!({"operator_type": "harmonic", "n_dimensions": 4}))
            .await
            .unwrap();
        assert_eq!(out["eigenvalues"], json!([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(out["matrix_shape"], json!([4, 4]));
    }

    #[tokio::test]
    async fn test_desi_uses_position_spectrum() {
        let out = exec(&backend(), RUN_SIMULATION, json!({"simulation_type": "DESI", "n_dimensions": 3}))
            .await
            .unwrap();
        assert_eq!(out["eigenvalues"], json!([-10.0, 0.0, 10.0]));
        assert_eq!(out["metadata"]["type"], "DESI");
    }

    #[tokio::test]
    async fn test_tree_spectrum_starts_at_zero() {
        let out = exec(&backend(), RUN_SIMULATION, json!({"simulation_type": "Tree", "n_dimensions": 10}))
            .await
            .unwrap();
        let first = out["eigenvalues"][0].as_f64().unwrap();
        assert!(first.abs() < 1e-12);
        assert_eq!(out["metadata"]["edges"], 9);
    }

    #[tokio::test]
    async fn test_bell_spectrum_trace() {
        let n = 8;
        let out = exec(&backend(), RUN_SIMULATION, json!({"simulation_type": "Bell", "n_dimensions": n}))
            .await
            .unwrap();
        let eigenvalues: Vec<f64> = serde_json::from_value(out["eigenvalues"].clone()).unwrap();
        assert_eq!(eigenvalues.len(), n);
        // 对角线全为 -1，迹为 -n
        let trace: f64 = eigenvalues.iter().sum();
        assert!((trace + n as f64).abs() < 1e-9, "trace {trace}");
        assert!(eigenvalues.iter().all(|v| *v <= 1e-12));
    }

    #[tokio::test]
    async fn test_ai_spectrum_reports_network_params() {
        let out = exec(&backend(), RUN_SIMULATION, json!({"simulation_type": "AI", "n_dimensions": 4}))
            .await
            .unwrap();
        let eigenvalues: Vec<f64> = serde_json::from_value(out["eigenvalues"].clone()).unwrap();
        assert_eq!(eigenvalues.len(), 4);
        assert!(eigenvalues.iter().all(|v| *v > 0.0));
        assert!((eigenvalues[3] - 1.0).abs() < 1e-12);
        assert_eq!(out["metadata"]["type"], "AI");
        assert_eq!(out["metadata"]["network_params"], 40);
    }

    #[tokio::test]
    async fn test_unknown_simulation_type_fails() {
        let err = exec(&backend(), RUN_SIMULATION, json!({"simulation_type": "Quantum"}))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Failed("unknown simulation type: Quantum".into()));
    }

    #[tokio::test]
    async fn test_operator_visualization_preview_and_histogram() {
        let out = exec(&backend(), OPERATOR_VISUALIZATION, json!({"operator_type": "harmonic", "n_dimensions": 100}))
            .await
            .unwrap();
        assert_eq!(out["eigenvalues"].as_array().unwrap().len(), PREVIEW_LEN);
        assert_eq!(out["eigenvalues"][0], 1.0);
        assert_eq!(out["matrix_shape"], json!([100, 100]));
        let counts: Vec<usize> = serde_json::from_value(out["histogram"]["counts"].clone()).unwrap();
        assert_eq!(counts.len(), HISTOGRAM_BINS);
        assert_eq!(counts.iter().sum::<usize>(), 100);
        assert_eq!(out["histogram"]["edges"].as_array().unwrap().len(), HISTOGRAM_BINS + 1);
    }

    #[test]
    fn test_histogram_constant_values() {
        let h = histogram(&[2.0, 2.0, 2.0], 4);
        assert_eq!(h["counts"], json!([3, 0, 0, 0]));
    }

    #[tokio::test]
    async fn test_dimension_limit() {
        let err = exec(&backend(), COMPUTE_EIGENVALUES, json!({"n_dimensions": 5000}))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let err = backend()
            .execute(&TaskType::new(COMPUTE_EIGENVALUES), json!({}), token)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Cancelled);
    }

    #[tokio::test]
    async fn test_repeated_failures_report_unhealthy() {
        let b = backend();
        for _ in 0..UNHEALTHY_AFTER_FAILURES {
            let _ = exec(&b, RUN_SIMULATION, json!({"simulation_type": "Quantum"})).await;
        }
        assert!(!b.health_status().healthy);

        exec(&b, COMPUTE_EIGENVALUES, json!({})).await.unwrap();
        assert!(b.health_status().healthy);
    }

    #[test]
    fn test_permissions_per_task_type() {
        let b = backend();
        assert_eq!(b.required_permissions(&TaskType::new(RUN_SIMULATION)), vec!["simulation"]);
        assert_eq!(b.required_permissions(&TaskType::new(OPERATOR_VISUALIZATION)), vec!["compute"]);
        assert!(b.required_permissions(&TaskType::new("other")).is_empty());
    }
}
