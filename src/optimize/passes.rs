//! Graph rewrites. Every pass returns whether it changed the graph.

use std::collections::{HashMap, HashSet};
use tract_onnx::pb::{GraphProto, NodeProto, TensorProto};
use tracing::debug;

use crate::core::{DetectorError, DetectorResult};
use crate::onnx::proto::{float_tensor, find_attr, tensor_values};

/// Default epsilon of `BatchNormalization`.
const BN_DEFAULT_EPSILON: f32 = 1e-5;

fn graph_outputs(graph: &GraphProto) -> HashSet<String> {
    graph.output.iter().map(|o| o.name.clone()).collect()
}

/// How many node inputs reference each value.
fn use_counts(graph: &GraphProto) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for input in graph.node.iter().flat_map(|n| n.input.iter()) {
        if !input.is_empty() {
            *counts.entry(input.clone()).or_insert(0) += 1;
        }
    }
    counts
}

fn rename_uses(graph: &mut GraphProto, from: &str, to: &str) {
    for node in &mut graph.node {
        for input in node.input.iter_mut().filter(|i| *i == from) {
            *input = to.to_string();
        }
    }
}

/// Removes a single-input node by wiring its consumers to its input.
///
/// When the node feeds a graph output, the producer of its input is renamed
/// instead; nodes whose input is itself a graph input or initializer are kept.
fn bypass(graph: &mut GraphProto, index: usize) -> bool {
    let node = &graph.node[index];
    let (Some(input), Some(output)) = (node.input.first().cloned(), node.output.first().cloned()) else {
        return false;
    };
    if graph_outputs(graph).contains(&output) {
        let Some(producer) = graph
            .node
            .iter()
            .position(|n| n.output.iter().any(|o| *o == input))
        else {
            return false;
        };
        if graph_outputs(graph).contains(&input) {
            return false;
        }
        for o in graph.node[producer].output.iter_mut().filter(|o| **o == input) {
            *o = output.clone();
        }
        graph.node.remove(index);
        rename_uses(graph, &input, &output);
    } else {
        graph.node.remove(index);
        rename_uses(graph, &output, &input);
    }
    true
}

fn bypass_matching(graph: &mut GraphProto, pass: &str, is_nop: impl Fn(&GraphProto, &NodeProto) -> bool) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < graph.node.len() {
        if is_nop(graph, &graph.node[i]) {
            let name = graph.node[i].name.clone();
            if bypass(graph, i) {
                debug!(pass, node = %name, "removed node");
                changed = true;
                continue;
            }
        }
        i += 1;
    }
    changed
}

/// Removes `Identity` nodes.
pub fn eliminate_identity(graph: &mut GraphProto) -> DetectorResult<bool> {
    Ok(bypass_matching(graph, "eliminate_identity", |_, n| n.op_type == "Identity"))
}

/// A dropout is a no-op when its ratio is zero and its mask output is unused.
fn is_nop_dropout(graph: &GraphProto, node: &NodeProto) -> bool {
    if node.op_type != "Dropout" {
        return false;
    }
    let mask_used = node.output.get(1).is_some_and(|mask| {
        !mask.is_empty()
            && (graph.node.iter().any(|n| n.input.contains(mask)) || graph_outputs(graph).contains(mask))
    });
    if mask_used {
        return false;
    }
    if let Some(ratio) = find_attr(node, "ratio") {
        return ratio.f == 0.0;
    }
    match node.input.get(1).filter(|r| !r.is_empty()) {
        Some(ratio) => graph
            .initializer
            .iter()
            .find(|t| t.name == *ratio)
            .and_then(|t| tensor_values(t).ok())
            .is_some_and(|v| v.len() == 1 && v[0] == 0.0),
        None => false,
    }
}

/// Removes dropouts that cannot drop anything: ratio 0, mask unused.
pub fn eliminate_nop_dropout(graph: &mut GraphProto) -> DetectorResult<bool> {
    Ok(bypass_matching(graph, "eliminate_nop_dropout", is_nop_dropout))
}

/// Removes nodes none of whose outputs reach a consumer or a graph output.
pub fn eliminate_deadend(graph: &mut GraphProto) -> DetectorResult<bool> {
    let outputs = graph_outputs(graph);
    let mut changed = false;
    loop {
        let used: HashSet<String> = graph
            .node
            .iter()
            .flat_map(|n| n.input.iter().cloned())
            .collect();
        let is_dead = |n: &NodeProto| {
            n.output
                .iter()
                .all(|o| o.is_empty() || (!used.contains(o) && !outputs.contains(o)))
        };
        let dead: Vec<String> = graph
            .node
            .iter()
            .filter(|n| is_dead(n))
            .map(|n| n.name.clone())
            .collect();
        if dead.is_empty() {
            break;
        }
        graph.node.retain(|n| !is_dead(n));
        debug!(pass = "eliminate_deadend", nodes = ?dead, "removed nodes");
        changed = true;
    }
    Ok(changed)
}

/// Drops initializers (and their graph input entries) that nothing reads.
pub fn eliminate_unused_initializer(graph: &mut GraphProto) -> DetectorResult<bool> {
    let mut used: HashSet<String> = graph
        .node
        .iter()
        .flat_map(|n| n.input.iter().cloned())
        .collect();
    used.extend(graph_outputs(graph));
    let unused: HashSet<String> = graph
        .initializer
        .iter()
        .filter(|t| !used.contains(&t.name))
        .map(|t| t.name.clone())
        .collect();
    if unused.is_empty() {
        return Ok(false);
    }
    graph.initializer.retain(|t| !unused.contains(&t.name));
    graph.input.retain(|i| !unused.contains(&i.name));
    debug!(pass = "eliminate_unused_initializer", removed = unused.len(), "removed initializers");
    Ok(true)
}

/// `base`, or `base_N` with the smallest N that no initializer, graph input or
/// node value already uses.
fn unique_name(graph: &GraphProto, base: &str) -> String {
    let taken: HashSet<&str> = graph
        .initializer
        .iter()
        .map(|t| t.name.as_str())
        .chain(graph.input.iter().map(|v| v.name.as_str()))
        .chain(graph.output.iter().map(|v| v.name.as_str()))
        .chain(
            graph
                .node
                .iter()
                .flat_map(|n| n.input.iter().chain(&n.output))
                .map(String::as_str),
        )
        .collect();
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|name| !taken.contains(name.as_str()))
        .unwrap_or_else(|| base.to_string())
}

fn initializer_index(graph: &GraphProto, name: &str) -> Option<usize> {
    graph.initializer.iter().position(|t| t.name == name)
}

fn initializer_values(graph: &GraphProto, name: &str) -> DetectorResult<Option<Vec<f32>>> {
    initializer_index(graph, name)
        .map(|i| tensor_values(&graph.initializer[i]))
        .transpose()
}

/// Folds the affine transform of an inference-mode batch norm into the
/// preceding convolution's weight and bias.
pub fn fuse_bn_into_conv(graph: &mut GraphProto) -> DetectorResult<bool> {
    let mut changed = false;
    let mut i = 0;
    while i < graph.node.len() {
        if graph.node[i].op_type != "BatchNormalization" || graph.node[i].output.len() != 1 {
            i += 1;
            continue;
        }
        let bn = graph.node[i].clone();
        let Some(conv_index) = graph
            .node
            .iter()
            .position(|n| n.op_type == "Conv" && bn.input.first().is_some_and(|x| n.output.first() == Some(x)))
        else {
            i += 1;
            continue;
        };
        let conv_name = graph.node[conv_index].name.clone();
        if fuse_pair(graph, conv_index, &bn)? {
            let bn_index = graph
                .node
                .iter()
                .position(|n| n.op_type == "BatchNormalization" && n.output == bn.output)
                .ok_or_else(|| DetectorError::graph(format!("batch norm '{}' vanished", bn.name)))?;
            graph.node.remove(bn_index);
            debug!(pass = "fuse_bn_into_conv", conv = %conv_name, bn = %bn.name, "fused");
            changed = true;
            continue;
        }
        i += 1;
    }
    Ok(changed)
}

fn fuse_pair(graph: &mut GraphProto, conv_index: usize, bn: &NodeProto) -> DetectorResult<bool> {
    let conv = graph.node[conv_index].clone();
    let (Some(conv_out), Some(weight_name)) = (conv.output.first(), conv.input.get(1)) else {
        return Ok(false);
    };
    let counts = use_counts(graph);
    if counts.get(conv_out).copied() != Some(1) || graph_outputs(graph).contains(conv_out) {
        return Ok(false);
    }
    if counts.get(weight_name).copied() != Some(1) {
        return Ok(false);
    }
    let bias_name = conv.input.get(2).filter(|b| !b.is_empty());
    if bias_name.is_some_and(|b| counts.get(b).copied() != Some(1)) {
        return Ok(false);
    }
    if bn.input.len() < 5 {
        return Ok(false);
    }

    let Some(weight_index) = initializer_index(graph, weight_name) else {
        return Ok(false);
    };
    let (Some(scale), Some(shift), Some(mean), Some(var)) = (
        initializer_values(graph, &bn.input[1])?,
        initializer_values(graph, &bn.input[2])?,
        initializer_values(graph, &bn.input[3])?,
        initializer_values(graph, &bn.input[4])?,
    ) else {
        return Ok(false);
    };
    let weight = &graph.initializer[weight_index];
    let out_channels = weight.dims.first().copied().unwrap_or(0) as usize;
    if [scale.len(), shift.len(), mean.len(), var.len()]
        .iter()
        .any(|&n| n != out_channels)
    {
        return Err(DetectorError::graph(format!(
            "batch norm '{}' has parameters that do not match {} conv output channels",
            bn.name, out_channels
        )));
    }
    let epsilon = find_attr(bn, "epsilon").map_or(BN_DEFAULT_EPSILON, |a| a.f);
    let factor: Vec<f32> = scale
        .iter()
        .zip(&var)
        .map(|(s, v)| s / (v + epsilon).sqrt())
        .collect();

    let mut w = tensor_values(weight)?;
    let per_channel = w.len() / out_channels.max(1);
    for (c, chunk) in w.chunks_mut(per_channel.max(1)).enumerate() {
        for v in chunk {
            *v *= factor[c];
        }
    }
    let conv_bias = match bias_name {
        Some(b) => initializer_values(graph, b)?.ok_or_else(|| {
            DetectorError::graph(format!("conv '{}' bias '{}' is not an initializer", conv.name, b))
        })?,
        None => vec![0.0; out_channels],
    };
    let bias: Vec<f32> = (0..out_channels)
        .map(|c| (conv_bias[c] - mean[c]) * factor[c] + shift[c])
        .collect();

    let dims = weight.dims.clone();
    graph.initializer[weight_index] = float_tensor(weight_name, &dims, &w);
    let fused_bias_name = match bias_name {
        Some(b) => b.clone(),
        None => unique_name(graph, &format!("{}_bias", bn.output[0])),
    };
    let fused_bias: TensorProto = float_tensor(&fused_bias_name, &[out_channels as i64], &bias);
    match initializer_index(graph, &fused_bias_name) {
        Some(idx) => graph.initializer[idx] = fused_bias,
        None => graph.initializer.push(fused_bias),
    }

    let node = &mut graph.node[conv_index];
    if node.input.len() < 3 {
        node.input.resize(3, String::new());
    }
    node.input[2] = fused_bias_name;
    node.output[0] = bn.output[0].clone();
    Ok(true)
}
