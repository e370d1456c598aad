//! Helpers for building and reading ONNX protobuf messages.
//!
//! The message types come from `tract_onnx::pb`, which carries the prost-generated
//! ONNX schema. Enum-typed fields are plain `i32` there; the constants below are the
//! values fixed by `onnx.proto`.

use candle_core::{DType, Tensor};
use tract_onnx::pb::{
    AttributeProto, NodeProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
    tensor_shape_proto, type_proto,
};

use crate::core::{DetectorError, DetectorResult};

/// `TensorProto.DataType.FLOAT`
pub const DATA_TYPE_FLOAT: i32 = 1;
/// `AttributeProto.AttributeType.FLOAT`
pub const ATTR_FLOAT: i32 = 1;
/// `AttributeProto.AttributeType.INT`
pub const ATTR_INT: i32 = 2;
/// `AttributeProto.AttributeType.INTS`
pub const ATTR_INTS: i32 = 7;

/// Integer attribute.
pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: ATTR_INT,
        i: value,
        ..Default::default()
    }
}

/// Integer list attribute, e.g. `kernel_shape` or `pads`.
pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: ATTR_INTS,
        ints: values.to_vec(),
        ..Default::default()
    }
}

/// Float attribute.
pub fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: ATTR_FLOAT,
        f: value,
        ..Default::default()
    }
}

/// Looks up an attribute of a node by name.
pub fn find_attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

/// Float tensor initializer from raw values.
pub fn float_tensor(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    TensorProto {
        name: name.to_string(),
        dims: dims.to_vec(),
        data_type: DATA_TYPE_FLOAT,
        raw_data: raw.into(),
        ..Default::default()
    }
}

/// Float tensor initializer copied out of a candle tensor.
pub fn tensor_proto(name: &str, tensor: &Tensor) -> DetectorResult<TensorProto> {
    let dims: Vec<i64> = tensor.dims().iter().map(|&d| d as i64).collect();
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(float_tensor(name, &dims, &values))
}

/// Decodes the values of a float tensor, from either `raw_data` or `float_data`.
pub fn tensor_values(tensor: &TensorProto) -> DetectorResult<Vec<f32>> {
    if tensor.data_type != DATA_TYPE_FLOAT {
        return Err(DetectorError::graph(format!(
            "tensor '{}' has data type {}, expected float",
            tensor.name, tensor.data_type
        )));
    }
    let expected: i64 = tensor.dims.iter().product();
    let raw = &tensor.raw_data[..];
    let values: Vec<f32> = if raw.is_empty() {
        tensor.float_data.clone()
    } else {
        if raw.len() % 4 != 0 {
            return Err(DetectorError::graph(format!(
                "tensor '{}' raw data length {} is not a multiple of 4",
                tensor.name,
                raw.len()
            )));
        }
        raw.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    };
    if values.len() as i64 != expected {
        return Err(DetectorError::graph(format!(
            "tensor '{}' holds {} values for dims {:?}",
            tensor.name,
            values.len(),
            tensor.dims
        )));
    }
    Ok(values)
}

/// A float tensor graph input/output with a fixed shape.
pub fn value_info(name: &str, dims: &[usize]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|&d| tensor_shape_proto::Dimension {
            value: Some(tensor_shape_proto::dimension::Value::DimValue(d as i64)),
            ..Default::default()
        })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: DATA_TYPE_FLOAT,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Fixed dimensions of a graph input/output, if fully known.
pub fn value_dims(info: &ValueInfoProto) -> Option<Vec<usize>> {
    let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
        ..
    }) = info.r#type.as_ref()
    else {
        return None;
    };
    tensor
        .shape
        .as_ref()?
        .dim
        .iter()
        .map(|d| match d.value {
            Some(tensor_shape_proto::dimension::Value::DimValue(v)) if v > 0 => Some(v as usize),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tensor_proto_roundtrips_values() {
        let t = Tensor::arange(0f32, 6f32, &Device::Cpu)
            .unwrap()
            .reshape((2, 3))
            .unwrap();
        let proto = tensor_proto("w", &t).unwrap();
        assert_eq!(proto.dims, vec![2, 3]);
        assert_eq!(tensor_values(&proto).unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_tensor_values_reads_float_data() {
        let proto = TensorProto {
            name: "b".to_string(),
            dims: vec![2],
            data_type: DATA_TYPE_FLOAT,
            float_data: vec![0.5, -1.0],
            ..Default::default()
        };
        assert_eq!(tensor_values(&proto).unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn test_tensor_values_rejects_wrong_count() {
        let mut proto = float_tensor("x", &[3], &[1.0, 2.0, 3.0]);
        proto.dims = vec![4];
        assert!(tensor_values(&proto).is_err());
    }

    #[test]
    fn test_value_info_dims() {
        let info = value_info("input", &[1, 3, 64, 48]);
        assert_eq!(value_dims(&info), Some(vec![1, 3, 64, 48]));
    }
}
