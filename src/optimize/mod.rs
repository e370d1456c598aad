//! Named rewrite passes over serialized ONNX graphs.
//!
//! Pass names follow onnxoptimizer so existing pass lists keep working. An empty
//! pass list is a passthrough: the file is rewritten byte for byte.

pub mod passes;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tract_onnx::pb::{GraphProto, ModelProto};
use tracing::{debug, info};

use crate::core::{DetectorError, DetectorResult, ProcessingStage};
use crate::onnx::{encode_model, read_model};
use crate::utils::write_atomic;

/// Upper bound on fixed-point rounds; every pass only ever shrinks the graph.
const MAX_ROUNDS: usize = 64;

/// A supported graph rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Drops `Identity` nodes.
    EliminateIdentity,
    /// Drops `Dropout` nodes with a zero ratio and no mask consumer.
    EliminateNopDropout,
    /// Drops nodes whose outputs reach nothing.
    EliminateDeadend,
    /// Drops initializers that no node reads.
    EliminateUnusedInitializer,
    /// Folds `BatchNormalization` into the preceding `Conv`.
    FuseBnIntoConv,
}

impl Pass {
    /// Every pass, in the order the default pipeline runs them.
    pub const ALL: [Pass; 5] = [
        Pass::EliminateIdentity,
        Pass::EliminateNopDropout,
        Pass::EliminateDeadend,
        Pass::EliminateUnusedInitializer,
        Pass::FuseBnIntoConv,
    ];

    /// The onnxoptimizer name of the pass.
    pub fn name(self) -> &'static str {
        match self {
            Pass::EliminateIdentity => "eliminate_identity",
            Pass::EliminateNopDropout => "eliminate_nop_dropout",
            Pass::EliminateDeadend => "eliminate_deadend",
            Pass::EliminateUnusedInitializer => "eliminate_unused_initializer",
            Pass::FuseBnIntoConv => "fuse_bn_into_conv",
        }
    }

    fn apply(self, graph: &mut GraphProto) -> DetectorResult<bool> {
        match self {
            Pass::EliminateIdentity => passes::eliminate_identity(graph),
            Pass::EliminateNopDropout => passes::eliminate_nop_dropout(graph),
            Pass::EliminateDeadend => passes::eliminate_deadend(graph),
            Pass::EliminateUnusedInitializer => passes::eliminate_unused_initializer(graph),
            Pass::FuseBnIntoConv => passes::fuse_bn_into_conv(graph),
        }
    }

    fn supported() -> String {
        Self::ALL.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pass {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| DetectorError::UnknownPass {
                name: s.to_string(),
                supported: Self::supported(),
            })
    }
}

/// Parses a list of pass names, failing on the first unknown one.
pub fn parse_passes<S: AsRef<str>>(names: &[S]) -> DetectorResult<Vec<Pass>> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

/// Applies `passes` in order, or repeatedly until none of them changes the
/// graph when `fixed_point` is set. Returns the model and whether it changed.
pub fn optimize(mut model: ModelProto, passes: &[Pass], fixed_point: bool) -> DetectorResult<(ModelProto, bool)> {
    if passes.is_empty() {
        return Ok((model, false));
    }
    let graph = model
        .graph
        .as_mut()
        .ok_or_else(|| DetectorError::graph("model has no graph"))?;

    let mut changed_any = false;
    for round in 1..=MAX_ROUNDS {
        let mut changed = false;
        for &pass in passes {
            let nodes = graph.node.len();
            let pass_changed = pass
                .apply(graph)
                .map_err(|e| DetectorError::processing(ProcessingStage::Optimize, format!("pass {pass}"), e))?;
            debug!(%pass, round, changed = pass_changed, nodes_before = nodes, nodes_after = graph.node.len());
            changed |= pass_changed;
        }
        changed_any |= changed;
        if !fixed_point || !changed {
            break;
        }
    }
    Ok((model, changed_any))
}

/// `model.onnx` -> `model_opt.onnx`, next to the input.
pub fn optimized_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_opt.{}", ext.to_string_lossy()),
        None => format!("{stem}_opt"),
    };
    path.with_file_name(name)
}

/// Reads, optimizes and writes a model, returning the output path.
pub fn optimize_file(path: &Path, passes: &[Pass], fixed_point: bool) -> DetectorResult<PathBuf> {
    let bytes = std::fs::read(path)?;
    let model = read_model(path)?;
    let nodes_before = model.graph.as_ref().map_or(0, |g| g.node.len());
    info!(
        path = %path.display(),
        passes = %passes.iter().map(|p| p.name()).collect::<Vec<_>>().join(","),
        fixed_point,
        "optimizing"
    );

    let (model, changed) = optimize(model, passes, fixed_point)?;
    let out = optimized_path(path);
    let encoded = if changed { encode_model(&model) } else { bytes };
    write_atomic(&out, &encoded).map_err(|e| {
        DetectorError::processing(ProcessingStage::Serialize, format!("write {}", out.display()), e)
    })?;
    info!(
        path = %out.display(),
        nodes_before,
        nodes_after = model.graph.as_ref().map_or(0, |g| g.node.len()),
        "wrote optimized model"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_names_roundtrip() {
        for pass in Pass::ALL {
            assert_eq!(pass.name().parse::<Pass>().unwrap(), pass);
        }
    }

    #[test]
    fn test_unknown_pass_lists_supported() {
        match "fuse_matmul_add_bias_into_gemm".parse::<Pass>() {
            Err(DetectorError::UnknownPass { name, supported }) => {
                assert_eq!(name, "fuse_matmul_add_bias_into_gemm");
                assert!(supported.contains("eliminate_deadend"));
            }
            other => panic!("expected unknown pass error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_passes_stops_at_unknown() {
        assert_eq!(
            parse_passes(&["eliminate_identity", "fuse_bn_into_conv"]).unwrap(),
            vec![Pass::EliminateIdentity, Pass::FuseBnIntoConv]
        );
        assert!(parse_passes(&["eliminate_identity", "nope"]).is_err());
    }

    #[test]
    fn test_optimized_path() {
        assert_eq!(
            optimized_path(Path::new("out/model.onnx")),
            PathBuf::from("out/model_opt.onnx")
        );
        assert_eq!(optimized_path(Path::new("model")), PathBuf::from("model_opt"));
    }

    #[test]
    fn test_empty_pass_list_is_passthrough() -> DetectorResult<()> {
        let model = ModelProto {
            ir_version: 7,
            ..Default::default()
        };
        let (out, changed) = optimize(model.clone(), &[], true)?;
        assert!(!changed);
        assert_eq!(out, model);
        Ok(())
    }

    #[test]
    fn test_failing_pass_names_the_stage() {
        use crate::onnx::proto::float_tensor;
        use tract_onnx::pb::NodeProto;

        // batch norm with three channels after a two-channel conv
        let node = |op: &str, inputs: &[&str], output: &str| NodeProto {
            op_type: op.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            ..Default::default()
        };
        let mut graph = GraphProto {
            node: vec![
                node("Conv", &["input", "w"], "c"),
                node("BatchNormalization", &["c", "s", "b", "m", "v"], "output"),
            ],
            ..Default::default()
        };
        graph.initializer.push(float_tensor("w", &[2, 1, 1, 1], &[1.0, 1.0]));
        for name in ["s", "b", "m", "v"] {
            graph.initializer.push(float_tensor(name, &[3], &[1.0, 1.0, 1.0]));
        }
        let model = ModelProto {
            graph: Some(graph),
            ..Default::default()
        };
        match optimize(model, &[Pass::FuseBnIntoConv], false) {
            Err(DetectorError::Processing { kind, context, .. }) => {
                assert_eq!(kind, ProcessingStage::Optimize);
                assert_eq!(context, "pass fuse_bn_into_conv");
            }
            other => panic!("expected optimize failure, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_graph_is_an_error() {
        let model = ModelProto::default();
        assert!(optimize(model, &[Pass::EliminateDeadend], false).is_err());
    }
}
