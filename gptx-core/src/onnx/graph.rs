//! Incremental ONNX graph assembly.
//!
//! `GraphBuilder` accumulates nodes, weight initializers and typed graph
//! inputs/outputs, then finalizes everything into a `ModelProto` with the
//! opset and producer stamped on.

use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    ValueInfoProto,
};

use super::proto::{self, Dim};

/// IR version 7 pairs with opset 14 (ONNX 1.9).
pub const IR_VERSION: i64 = 7;
pub const OPSET_VERSION: i64 = 14;

#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, name: &str, elem_type: DataType, dims: &[Dim]) {
        self.inputs.push(proto::tensor_value_info(name, elem_type, dims));
    }

    pub fn output(&mut self, name: &str, elem_type: DataType, dims: &[Dim]) {
        self.outputs.push(proto::tensor_value_info(name, elem_type, dims));
    }

    /// Add an f32 weight initializer; returns the tensor name for chaining.
    pub fn init_f32(&mut self, name: &str, dims: &[i64], data: &[f32]) -> String {
        self.initializers.push(proto::float_tensor(name, dims, data));
        name.to_string()
    }

    pub fn init_i64(&mut self, name: &str, dims: &[i64], data: &[i64]) -> String {
        self.initializers.push(proto::int64_tensor(name, dims, data));
        name.to_string()
    }

    pub fn scalar_f32(&mut self, name: &str, value: f32) -> String {
        self.init_f32(name, &[], &[value])
    }

    pub fn scalar_i64(&mut self, name: &str, value: i64) -> String {
        self.init_i64(name, &[], &[value])
    }

    /// Append a single-output node; returns the output tensor name.
    pub fn node(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: &[&str],
        output: &str,
        attributes: Vec<AttributeProto>,
    ) -> String {
        self.nodes
            .push(proto::node(op_type, name, inputs, &[output], attributes));
        output.to_string()
    }

    /// Append a multi-output node (e.g. `Split`).
    pub fn node_multi(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
        attributes: Vec<AttributeProto>,
    ) {
        self.nodes
            .push(proto::node(op_type, name, inputs, outputs, attributes));
    }

    pub fn finish(self, graph_name: &str, doc_string: &str) -> ModelProto {
        let graph = GraphProto {
            name: graph_name.to_string(),
            node: self.nodes,
            initializer: self.initializers,
            input: self.inputs,
            output: self.outputs,
            doc_string: doc_string.to_string(),
            ..Default::default()
        };
        ModelProto {
            ir_version: IR_VERSION,
            producer_name: "gptx".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn finished_model_declares_opset_and_io() {
        let mut g = GraphBuilder::new();
        g.input("x", DataType::Float, &[Dim::Dynamic("n")]);
        g.output("y", DataType::Float, &[Dim::Dynamic("n")]);
        let two = g.scalar_f32("two", 2.0);
        g.node("Mul", "double", &["x", &two], "y", vec![]);
        let model = g.finish("double", "");

        assert_eq!(model.ir_version, IR_VERSION);
        assert_eq!(model.opset_import.len(), 1);
        assert_eq!(model.opset_import[0].version, OPSET_VERSION);
        let graph = model.graph.unwrap();
        assert_eq!(graph.input.len(), 1);
        assert_eq!(graph.output.len(), 1);
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.initializer.len(), 1);
    }

    #[test]
    fn every_node_input_is_resolvable() {
        let mut g = GraphBuilder::new();
        g.input("x", DataType::Float, &[Dim::Fixed(4)]);
        let one = g.scalar_f32("one", 1.0);
        let shifted = g.node("Add", "shift", &["x", &one], "shifted", vec![]);
        g.node("Relu", "clamp", &[&shifted], "y", vec![]);
        g.output("y", DataType::Float, &[Dim::Fixed(4)]);
        let model = g.finish("t", "");
        let graph = model.graph.unwrap();

        let mut known: HashSet<&str> = graph.input.iter().map(|i| i.name.as_str()).collect();
        known.extend(graph.initializer.iter().map(|i| i.name.as_str()));
        for node in &graph.node {
            for input in &node.input {
                assert!(known.contains(input.as_str()), "unresolved input {input}");
            }
            known.extend(node.output.iter().map(|o| o.as_str()));
        }
        for output in &graph.output {
            assert!(known.contains(output.name.as_str()));
        }
    }
}
