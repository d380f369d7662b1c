//! Constructors for the ONNX protobuf types.
//!
//! The schema itself comes from `candle-onnx`'s prost-generated bindings;
//! these helpers only cut down on the `..Default::default()` noise when
//! assembling tensors, value infos and node attributes by hand.

use candle_onnx::onnx::attribute_proto::AttributeType;
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::tensor_shape_proto::dimension;
use candle_onnx::onnx::tensor_shape_proto::Dimension;
use candle_onnx::onnx::type_proto;
use candle_onnx::onnx::{
    AttributeProto, NodeProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

/// One axis of a declared graph input/output: either a fixed size or a
/// named dynamic dimension.
#[derive(Debug, Clone)]
pub enum Dim {
    Fixed(i64),
    Dynamic(&'static str),
}

impl Dim {
    fn to_proto(&self) -> Dimension {
        let value = match self {
            Dim::Fixed(n) => dimension::Value::DimValue(*n),
            Dim::Dynamic(name) => dimension::Value::DimParam((*name).to_string()),
        };
        Dimension {
            value: Some(value),
            ..Default::default()
        }
    }
}

/// Typed tensor descriptor for a graph input or output.
pub fn tensor_value_info(name: &str, elem_type: DataType, dims: &[Dim]) -> ValueInfoProto {
    let shape = TensorShapeProto {
        dim: dims.iter().map(Dim::to_proto).collect(),
    };
    let tensor_type = type_proto::Tensor {
        elem_type: elem_type as i32,
        shape: Some(shape),
    };
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(tensor_type)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// F32 initializer with little-endian raw data.
pub fn float_tensor(name: &str, dims: &[i64], data: &[f32]) -> TensorProto {
    let mut raw_data = Vec::with_capacity(data.len() * 4);
    for v in data {
        raw_data.extend_from_slice(&v.to_le_bytes());
    }
    TensorProto {
        name: name.to_string(),
        dims: dims.to_vec(),
        data_type: DataType::Float as i32,
        raw_data,
        ..Default::default()
    }
}

/// Int64 initializer with little-endian raw data.
pub fn int64_tensor(name: &str, dims: &[i64], data: &[i64]) -> TensorProto {
    let mut raw_data = Vec::with_capacity(data.len() * 8);
    for v in data {
        raw_data.extend_from_slice(&v.to_le_bytes());
    }
    TensorProto {
        name: name.to_string(),
        dims: dims.to_vec(),
        data_type: DataType::Int64 as i32,
        raw_data,
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

pub fn node(
    op_type: &str,
    name: &str,
    inputs: &[&str],
    outputs: &[&str],
    attributes: Vec<AttributeProto>,
) -> NodeProto {
    NodeProto {
        op_type: op_type.to_string(),
        name: name.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        attribute: attributes,
        ..Default::default()
    }
}
