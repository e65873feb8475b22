//! Kernel execution engine
//!
//! Walks a [`BuildGraph`] in arena order and calls the kernel once per node
//! (a `polar_array` makes one call per copy). A build is all-or-nothing:
//! when any node fails, times out or is cancelled, every solid the build
//! created is released before the error is returned. A completed build
//! keeps only its output solids, inside a [`FinishedBuild`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use glam::{DAffine3, DQuat, DVec3};
use pf_kernel::{Axis3D, BooleanType, GeometryKernel, KernelResult, Primitive, SolidHandle};
use serde::{Deserialize, Serialize};

use crate::graph::{BuildGraph, BuildNode};
use crate::request::{BuildSpecification, Fingerprint, OpKind};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest a single node may spend inside the kernel
    pub node_time_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_time_budget_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn node_time_budget(&self) -> Duration {
        Duration::from_millis(self.node_time_budget_ms)
    }
}

/// Cooperative cancellation flag, checked between nodes
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Operation '{node}' took {elapsed:?}, over its budget of {budget:?}")]
    KernelTimeout {
        node: String,
        elapsed: Duration,
        budget: Duration,
    },
    #[error("Operation '{node}' failed: {diagnostic}")]
    Geometry { node: String, diagnostic: String },
    #[error("Build cancelled before operation '{node}'")]
    Cancelled { node: String },
}

impl EngineError {
    pub fn node(&self) -> &str {
        match self {
            EngineError::KernelTimeout { node, .. }
            | EngineError::Geometry { node, .. }
            | EngineError::Cancelled { node } => node,
        }
    }
}

/// A degraded optional feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildWarning {
    pub node: String,
    pub message: String,
}

/// A named terminal solid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub name: String,
    pub handle: SolidHandle,
}

/// A completed build: the kernel instance and its output solids
///
/// Only [`Engine::evaluate`] creates one, so holding a `FinishedBuild` means
/// evaluation is over. Dropping it releases the output solids.
pub struct FinishedBuild<K: GeometryKernel> {
    kernel: K,
    outputs: Vec<BuildOutput>,
    warnings: Vec<BuildWarning>,
    fingerprint: Fingerprint,
}

impl<K: GeometryKernel> FinishedBuild<K> {
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn outputs(&self) -> &[BuildOutput] {
        &self.outputs
    }

    /// Output handles in output order
    pub fn handles(&self) -> Vec<SolidHandle> {
        self.outputs.iter().map(|o| o.handle).collect()
    }

    pub fn warnings(&self) -> &[BuildWarning] {
        &self.warnings
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl<K: GeometryKernel> Drop for FinishedBuild<K> {
    fn drop(&mut self) {
        let mut released = HashSet::new();
        for output in &self.outputs {
            if released.insert(output.handle) {
                self.kernel.release(output.handle);
            }
        }
    }
}

impl<K: GeometryKernel> std::fmt::Debug for FinishedBuild<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishedBuild")
            .field("kernel", &self.kernel.name())
            .field("outputs", &self.outputs)
            .field("warnings", &self.warnings)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Per-build evaluation state
struct Evaluation<'k, K: GeometryKernel> {
    kernel: &'k mut K,
    created: Vec<SolidHandle>,
    results: Vec<Option<SolidHandle>>,
    warnings: Vec<BuildWarning>,
}

impl<K: GeometryKernel> Evaluation<'_, K> {
    fn keep(&mut self, result: KernelResult<SolidHandle>) -> KernelResult<SolidHandle> {
        let handle = result?;
        self.created.push(handle);
        Ok(handle)
    }

    fn input(&self, node: &BuildNode, index: usize) -> Result<SolidHandle, EngineError> {
        node.inputs
            .get(index)
            .and_then(|id| self.results[id.0])
            .ok_or_else(|| EngineError::Geometry {
                node: node.name.clone(),
                diagnostic: format!("input {} has not been evaluated", index),
            })
    }

    fn release_all(&mut self) {
        for handle in self.created.drain(..) {
            self.kernel.release(handle);
        }
    }

    fn apply(&mut self, node: &BuildNode, inputs: &[SolidHandle]) -> KernelResult<SolidHandle> {
        match &node.op {
            OpKind::Box { size, center } => {
                let primitive = Primitive::Box {
                    size: DVec3::from_array(*size),
                };
                let placement = DAffine3::from_translation(DVec3::from_array(*center));
                let result = self.kernel.construct(&primitive, placement);
                self.keep(result)
            }
            OpKind::Cylinder {
                radius,
                height,
                center,
                axis,
            } => {
                let primitive = Primitive::Cylinder {
                    radius: *radius,
                    height: *height,
                };
                let direction = DVec3::from_array(*axis).normalize();
                let placement = DAffine3::from_translation(DVec3::from_array(*center))
                    * DAffine3::from_quat(DQuat::from_rotation_arc(DVec3::Z, direction));
                let result = self.kernel.construct(&primitive, placement);
                self.keep(result)
            }
            OpKind::Sphere { radius, center } => {
                let primitive = Primitive::Sphere { radius: *radius };
                let placement = DAffine3::from_translation(DVec3::from_array(*center));
                let result = self.kernel.construct(&primitive, placement);
                self.keep(result)
            }
            OpKind::Translate { offset } => {
                let result = self
                    .kernel
                    .transform(inputs[0], DAffine3::from_translation(DVec3::from_array(*offset)));
                self.keep(result)
            }
            OpKind::Rotate {
                angle,
                axis,
                origin,
            } => {
                let axis = Axis3D::new(DVec3::from_array(*origin), DVec3::from_array(*axis));
                let result = self.kernel.transform(inputs[0], axis.rotation(angle.to_radians()));
                self.keep(result)
            }
            OpKind::Scale { factor } => {
                let result = self
                    .kernel
                    .transform(inputs[0], DAffine3::from_scale(DVec3::splat(*factor)));
                self.keep(result)
            }
            OpKind::PolarArray {
                count,
                axis,
                origin,
            } => {
                let axis = Axis3D::new(DVec3::from_array(*origin), DVec3::from_array(*axis));
                let step = std::f64::consts::TAU / *count as f64;
                let mut combined = inputs[0];
                for k in 1..*count {
                    let copy = self.kernel.transform(inputs[0], axis.rotation(step * k as f64));
                    let copy = self.keep(copy)?;
                    let fused = self.kernel.combine(combined, copy, BooleanType::Union);
                    combined = self.keep(fused)?;
                }
                Ok(combined)
            }
            OpKind::Union => self.combine(inputs, BooleanType::Union),
            OpKind::Subtract => self.combine(inputs, BooleanType::Subtract),
            OpKind::Intersect => self.combine(inputs, BooleanType::Intersect),
            OpKind::Fillet { radius, edges } => {
                if *radius == 0.0 {
                    return Ok(inputs[0]);
                }
                let result = self.kernel.fillet(inputs[0], edges, *radius);
                self.keep(result)
            }
            OpKind::Chamfer { distance, edges } => {
                if *distance == 0.0 {
                    return Ok(inputs[0]);
                }
                let result = self.kernel.chamfer(inputs[0], edges, *distance);
                self.keep(result)
            }
        }
    }

    fn combine(&mut self, inputs: &[SolidHandle], op: BooleanType) -> KernelResult<SolidHandle> {
        let result = self.kernel.combine(inputs[0], inputs[1], op);
        self.keep(result)
    }

    fn run(&mut self, graph: &BuildGraph, cancel: &CancelToken, budget: Duration) -> Result<(), EngineError> {
        for node in graph.evaluation_order() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled {
                    node: node.name.clone(),
                });
            }

            if !node.enabled {
                tracing::debug!(node = %node.name, "operation disabled, passing input through");
                self.results[node.id.0] = Some(self.input(node, 0)?);
                continue;
            }

            let inputs = (0..node.inputs.len())
                .map(|i| self.input(node, i))
                .collect::<Result<Vec<_>, _>>()?;

            let started = Instant::now();
            let result = self.apply(node, &inputs);
            let elapsed = started.elapsed();
            tracing::debug!(
                node = %node.name,
                op = node.op.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                ok = result.is_ok(),
                "evaluated operation"
            );

            if elapsed > budget {
                return Err(EngineError::KernelTimeout {
                    node: node.name.clone(),
                    elapsed,
                    budget,
                });
            }

            let handle = match result {
                Ok(handle) => handle,
                Err(error) if node.optional => {
                    tracing::warn!(node = %node.name, %error, "optional feature skipped");
                    self.warnings.push(BuildWarning {
                        node: node.name.clone(),
                        message: error.to_string(),
                    });
                    inputs[0]
                }
                Err(error) => {
                    return Err(EngineError::Geometry {
                        node: node.name.clone(),
                        diagnostic: error.to_string(),
                    });
                }
            };
            self.results[node.id.0] = Some(handle);
        }
        Ok(())
    }
}

/// Evaluates build graphs against a kernel instance
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate `graph` with a kernel instance owned by this build
    pub fn evaluate<K: GeometryKernel>(
        &self,
        mut kernel: K,
        spec: &BuildSpecification,
        graph: &BuildGraph,
        cancel: &CancelToken,
    ) -> Result<FinishedBuild<K>, EngineError> {
        let started = Instant::now();
        let mut eval = Evaluation {
            kernel: &mut kernel,
            created: Vec::new(),
            results: vec![None; graph.len()],
            warnings: Vec::new(),
        };

        let outcome = eval.run(graph, cancel, self.config.node_time_budget()).and_then(|()| {
            graph
                .outputs()
                .iter()
                .map(|&id| {
                    let node = graph.node(id);
                    eval.results[id.0]
                        .map(|handle| BuildOutput {
                            name: node.name.clone(),
                            handle,
                        })
                        .ok_or_else(|| EngineError::Geometry {
                            node: node.name.clone(),
                            diagnostic: "output was not evaluated".into(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        });

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(error) => {
                let released = eval.created.len();
                eval.release_all();
                tracing::warn!(
                    fingerprint = %spec.fingerprint(),
                    %error,
                    released,
                    "build failed"
                );
                return Err(error);
            }
        };

        // Keep the outputs, free every intermediate solid
        let keep: HashSet<SolidHandle> = outputs.iter().map(|o| o.handle).collect();
        for handle in std::mem::take(&mut eval.created) {
            if !keep.contains(&handle) {
                eval.kernel.release(handle);
            }
        }
        let warnings = std::mem::take(&mut eval.warnings);

        tracing::info!(
            fingerprint = %spec.fingerprint(),
            kernel = kernel.name(),
            nodes = graph.evaluation_order().count(),
            warnings = warnings.len(),
            live_solids = kernel.live_solids(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );

        Ok(FinishedBuild {
            kernel,
            outputs,
            warnings,
            fingerprint: spec.fingerprint().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_value;
    use pf_kernel::kernel::fake::{FakeKernel, FakeOp, FakeStats};
    use pf_kernel::{ImplicitKernel, KernelError};
    use serde_json::{Value, json};

    fn evaluate<K: GeometryKernel>(
        kernel: K,
        request: Value,
        config: EngineConfig,
        cancel: &CancelToken,
    ) -> Result<FinishedBuild<K>, EngineError> {
        let spec = parse_value(&request).unwrap();
        let graph = BuildGraph::from_spec(&spec).unwrap();
        Engine::new(config).evaluate(kernel, &spec, &graph, cancel)
    }

    fn run<K: GeometryKernel>(kernel: K, request: Value) -> Result<FinishedBuild<K>, EngineError> {
        evaluate(kernel, request, EngineConfig::default(), &CancelToken::new())
    }

    fn fake() -> (FakeKernel, Arc<FakeStats>) {
        let kernel = FakeKernel::new();
        let stats = kernel.stats();
        (kernel, stats)
    }

    fn two_boxes_union() -> Value {
        json!({"operations": [
            {"id": "a", "op": "box", "size": [2, 2, 2]},
            {"id": "b", "op": "box", "size": [2, 2, 2], "center": [1, 0, 0]},
            {"id": "moved", "op": "translate", "input": "b", "offset": [0, 1, 0]},
            {"id": "fused", "op": "union", "inputs": ["a", "moved"]}
        ]})
    }

    #[test]
    fn test_intermediates_released_after_success() {
        let (kernel, stats) = fake();
        let finished = run(kernel, two_boxes_union()).unwrap();

        assert_eq!(stats.calls(), 4);
        assert_eq!(stats.created(), 4);
        assert_eq!(stats.live(), 1);
        assert_eq!(finished.outputs().len(), 1);
        assert_eq!(finished.outputs()[0].name, "fused");
        assert_eq!(finished.kernel().live_solids(), 1);

        drop(finished);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_failure_in_final_node_releases_everything() {
        let kernel = FakeKernel::new().failing(FakeOp::Combine, KernelError::NonManifold("open shell".into()));
        let stats = kernel.stats();
        let err = run(kernel, two_boxes_union()).unwrap_err();

        match err {
            EngineError::Geometry { node, diagnostic } => {
                assert_eq!(node, "fused");
                assert!(diagnostic.contains("open shell"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(stats.created(), 3);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_empty_subtraction_is_geometry_error() {
        let err = run(
            ImplicitKernel::new(),
            json!({"operations": [
                {"id": "small", "op": "box", "size": [10, 10, 10]},
                {"id": "large", "op": "box", "size": [20, 20, 20]},
                {"id": "hollow", "op": "subtract", "inputs": ["small", "large"]}
            ]}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Geometry { ref node, .. } if node == "hollow"));
    }

    #[test]
    fn test_coincident_subtraction_is_geometry_error() {
        let err = run(
            ImplicitKernel::new(),
            json!({"operations": [
                {"id": "a", "op": "box", "size": [10, 10, 10]},
                {"id": "b", "op": "box", "size": [10, 10, 10]},
                {"id": "cut", "op": "subtract", "inputs": ["a", "b"]}
            ]}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Geometry { ref node, .. } if node == "cut"));
    }

    #[test]
    fn test_deep_union_chain_fails_cleanly() {
        let mut ops = vec![json!({"id": "u0", "op": "box", "size": [1, 1, 1]})];
        ops.extend((1..600).map(|i| {
            json!({"id": format!("u{}", i), "op": "union", "inputs": [format!("u{}", i - 1), "u0"]})
        }));
        let kernel = ImplicitKernel::new();
        let err = run(kernel, json!({ "operations": ops })).unwrap_err();

        match err {
            EngineError::Geometry { node, diagnostic } => {
                assert_eq!(node, "u513");
                assert!(diagnostic.contains("nest"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_slow_node_times_out() {
        let kernel = FakeKernel::new().with_delay(Duration::from_millis(30));
        let stats = kernel.stats();
        let config = EngineConfig {
            node_time_budget_ms: 5,
        };
        let err = evaluate(kernel, two_boxes_union(), config, &CancelToken::new()).unwrap_err();

        match err {
            EngineError::KernelTimeout { node, elapsed, budget } => {
                assert_eq!(node, "a");
                assert!(elapsed > budget);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(stats.calls(), 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_cancelled_build_makes_no_calls() {
        let (kernel, stats) = fake();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = evaluate(kernel, two_boxes_union(), EngineConfig::default(), &cancel).unwrap_err();

        assert_eq!(err, EngineError::Cancelled { node: "a".into() });
        assert_eq!(stats.calls(), 0);
    }

    #[test]
    fn test_cancel_mid_build_releases_everything() {
        let kernel = FakeKernel::new().with_delay(Duration::from_millis(100));
        let stats = kernel.stats();
        let cancel = CancelToken::new();

        let err = std::thread::scope(|scope| {
            let canceller = cancel.clone();
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                canceller.cancel();
            });
            evaluate(kernel, two_boxes_union(), EngineConfig::default(), &cancel).unwrap_err()
        });

        assert!(matches!(err, EngineError::Cancelled { ref node, .. } if node != "a"));
        assert!(stats.calls() >= 1 && stats.calls() < 4);
        assert!(stats.created() >= 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_optional_feature_degrades_to_input() {
        let kernel = FakeKernel::new().failing(FakeOp::Fillet, KernelError::Unsupported("fillet".into()));
        let stats = kernel.stats();
        let finished = run(
            kernel,
            json!({"operations": [
                {"id": "body", "op": "box", "size": [4, 4, 4]},
                {"id": "soft", "op": "fillet", "input": "body", "radius": 0.5, "optional": true}
            ]}),
        )
        .unwrap();

        assert_eq!(
            finished.warnings(),
            &[BuildWarning {
                node: "soft".into(),
                message: "Unsupported operation: fillet".into()
            }]
        );
        assert_eq!(stats.live(), 1);
    }

    #[test]
    fn test_passthrough_nodes_make_no_calls() {
        let (kernel, stats) = fake();
        let finished = run(
            kernel,
            json!({
                "parameters": {"extra": false},
                "operations": [
                    {"id": "body", "op": "box", "size": [4, 4, 4]},
                    {"id": "sharp", "op": "fillet", "input": "body", "radius": 0},
                    {"id": "disk", "op": "sphere", "radius": 1},
                    {"id": "with_disk", "op": "union", "inputs": ["sharp", "disk"], "when": "$extra"}
                ]
            }),
        )
        .unwrap();

        assert_eq!(stats.calls(), 1);
        assert_eq!(finished.outputs()[0].name, "with_disk");
        assert_eq!(stats.live(), 1);
    }

    #[test]
    fn test_polar_array_calls() {
        let (kernel, stats) = fake();
        let finished = run(
            kernel,
            json!({"operations": [
                {"id": "prong", "op": "cylinder", "radius": 0.5, "height": 2, "center": [3, 0, 0]},
                {"id": "ring", "op": "polar_array", "input": "prong", "count": 4}
            ]}),
        )
        .unwrap();

        // One construct, then a rotated copy and a union per extra instance
        assert_eq!(stats.calls(), 7);
        assert_eq!(stats.live(), 1);
        let mesh = finished
            .kernel()
            .tessellate(finished.outputs()[0].handle, &Default::default())
            .unwrap();
        let (min, max) = mesh.bounds().unwrap();
        approx::assert_relative_eq!(min[0], -3.5, epsilon = 1e-5);
        approx::assert_relative_eq!(max[1], 3.5, epsilon = 1e-5);
    }

    #[test]
    fn test_multiple_outputs_share_handles() {
        let (kernel, stats) = fake();
        let finished = run(
            kernel,
            json!({
                "operations": [
                    {"id": "body", "op": "box", "size": [1, 1, 1]},
                    {"id": "same", "op": "chamfer", "input": "body", "distance": 0}
                ],
                "outputs": ["body", "same"]
            }),
        )
        .unwrap();
        assert_eq!(finished.handles()[0], finished.handles()[1]);
        drop(finished);
        assert_eq!(stats.live(), 0);
    }
}
