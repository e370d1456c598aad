//! Static graph construction by walking a network's layers.
//!
//! A network is "traced" by asking every layer to append the ONNX nodes that
//! compute it. The walk only depends on the network structure, never on tensor
//! values, so the emitted graph is the same for every input of the configured
//! shape.

use candle_core::Tensor;
use std::collections::{HashMap, HashSet};
use tract_onnx::pb::{AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto};

use super::proto::{tensor_proto, value_info};
use crate::core::{DetectorError, DetectorResult};

/// ONNX IR version paired with the exported operator sets.
pub const IR_VERSION: i64 = 7;

/// Name of the graph input.
pub const INPUT_NAME: &str = "input";
/// Name of the graph output.
pub const OUTPUT_NAME: &str = "output";

/// A module that can be emitted into an ONNX graph.
pub trait Traceable {
    /// Appends the nodes computing this module on `input` and returns the name of
    /// the produced value.
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String>;

    /// Appends `(state-dict name, tensor)` for every parameter of the module.
    fn parameters(&self, out: &mut Vec<(String, Tensor)>);
}

/// Shapes and versions of a finished graph.
#[derive(Debug, Clone)]
pub struct GraphSpec {
    pub graph_name: String,
    /// Fixed `[N, C, H, W]` of the input.
    pub input_dims: Vec<usize>,
    pub output_dims: Vec<usize>,
    /// Version of the default (`ai.onnx`) operator set.
    pub opset: i64,
}

/// Accumulates nodes and initializers while a network is traced.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    initializer_names: HashSet<String>,
    node_names: HashMap<String, usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes emitted so far.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Distinct parameters registered so far.
    pub fn initializer_count(&self) -> usize {
        self.initializers.len()
    }

    /// Registers a parameter as an initializer and returns its value name.
    ///
    /// Registering the same name twice is a no-op.
    pub fn initializer(&mut self, name: &str, tensor: &Tensor) -> DetectorResult<String> {
        if self.initializer_names.insert(name.to_string()) {
            self.initializers.push(tensor_proto(name, tensor)?);
        }
        Ok(name.to_string())
    }

    /// Appends a single-output node and returns the name of its output value.
    ///
    /// Node names follow `/<scope>/<OpType>`, suffixed with a counter when the
    /// same scope emits the op more than once.
    pub fn node(
        &mut self,
        scope: &str,
        op_type: &str,
        inputs: &[&str],
        attribute: Vec<AttributeProto>,
    ) -> String {
        let base = if scope.is_empty() {
            format!("/{op_type}")
        } else {
            format!("/{}/{}", scope.replace('.', "/"), op_type)
        };
        let seen = self.node_names.entry(base.clone()).or_insert(0);
        let name = if *seen == 0 {
            base
        } else {
            format!("{base}_{seen}")
        };
        *seen += 1;
        let output = format!("{name}_output_0");
        self.nodes.push(NodeProto {
            name,
            op_type: op_type.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.clone()],
            attribute,
            ..Default::default()
        });
        output
    }

    /// Finishes the graph, renaming the value `output` to [`OUTPUT_NAME`].
    pub fn build(mut self, output: &str, spec: &GraphSpec) -> DetectorResult<ModelProto> {
        let producer = self
            .nodes
            .iter_mut()
            .rev()
            .find(|n| n.output.iter().any(|o| o == output))
            .ok_or_else(|| DetectorError::graph(format!("no node produces '{output}'")))?;
        for o in producer.output.iter_mut().filter(|o| *o == output) {
            *o = OUTPUT_NAME.to_string();
        }
        for node in &mut self.nodes {
            for i in node.input.iter_mut().filter(|i| *i == output) {
                *i = OUTPUT_NAME.to_string();
            }
        }

        let graph = GraphProto {
            name: spec.graph_name.clone(),
            node: self.nodes,
            initializer: self.initializers,
            input: vec![value_info(INPUT_NAME, &spec.input_dims)],
            output: vec![value_info(OUTPUT_NAME, &spec.output_dims)],
            ..Default::default()
        };
        Ok(ModelProto {
            ir_version: IR_VERSION,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: spec.opset,
            }],
            graph: Some(graph),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_node_names_are_unique_per_scope() {
        let mut g = GraphBuilder::new();
        let a = g.node("conv_1", "Relu", &[INPUT_NAME], vec![]);
        let b = g.node("conv_1", "Relu", &[&a], vec![]);
        assert_eq!(a, "/conv_1/Relu_output_0");
        assert_eq!(b, "/conv_1/Relu_1_output_0");
    }

    #[test]
    fn test_initializer_is_registered_once() {
        let mut g = GraphBuilder::new();
        let t = Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap();
        g.initializer("conv.bias", &t).unwrap();
        g.initializer("conv.bias", &t).unwrap();
        assert_eq!(g.initializer_count(), 1);
    }

    #[test]
    fn test_build_renames_final_value() {
        let mut g = GraphBuilder::new();
        let out = g.node("", "Relu", &[INPUT_NAME], vec![]);
        let spec = GraphSpec {
            graph_name: "main_graph".to_string(),
            input_dims: vec![1, 1, 4, 4],
            output_dims: vec![1, 1, 4, 4],
            opset: 12,
        };
        let model = g.build(&out, &spec).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.node[0].output, vec![OUTPUT_NAME.to_string()]);
        assert_eq!(graph.input[0].name, INPUT_NAME);
        assert_eq!(model.opset_import[0].version, 12);
        assert_eq!(model.ir_version, IR_VERSION);
    }

    #[test]
    fn test_build_fails_for_unknown_output() {
        let g = GraphBuilder::new();
        let spec = GraphSpec {
            graph_name: "g".to_string(),
            input_dims: vec![1],
            output_dims: vec![1],
            opset: 12,
        };
        assert!(g.build("missing", &spec).is_err());
    }
}
