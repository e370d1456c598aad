//! ONNX graph emission and protobuf helpers.
//!
//! Networks are traced into a [`tract_onnx::pb::ModelProto`] with
//! [`GraphBuilder`]; the same message types are read back by the optimizer and
//! the runtime.

pub mod builder;
pub mod proto;

pub use builder::{GraphBuilder, GraphSpec, INPUT_NAME, IR_VERSION, OUTPUT_NAME, Traceable};

use prost::Message;
use std::path::Path;
use tract_onnx::pb::ModelProto;

use crate::core::DetectorResult;

/// Reads and decodes a serialized ONNX model.
pub fn read_model(path: &Path) -> DetectorResult<ModelProto> {
    let bytes = std::fs::read(path)?;
    Ok(ModelProto::decode(bytes.as_slice())?)
}

/// Encodes a model to its protobuf wire form.
pub fn encode_model(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}
