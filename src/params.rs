//! Parameter provider interface (§6.1): how layers pull weights and biases from whatever storage
//! the caller chose (memory-mapped file, embedded resource, network fetch) without the engine
//! ever owning persistent host memory for them.

use crate::error::{Error, MissingParam, Result};

/// Element type of a parameter blob, distinct from [`crate::tensor::ElementType`] since weights
/// may additionally arrive 4-bit-quantized (`Uint4`, two nibbles per byte) for `MatMulConst`
/// (§4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamElementType {
    Uint8,
    Int8,
    Float,
    Float16,
    /// Packed 4-bit nibbles, two values per byte, low nibble first.
    Uint4,
}

/// A scale/zero dequantization pair, present when `element_type` is `Uint8`, `Int8`, or `Uint4`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantization {
    pub scale: f32,
    pub zero: f32,
}

/// A read-only view onto a parameter blob supplied by the caller's backing store.
///
/// `data` borrows from whatever the provider owns; layers copy it into a GPU texture during
/// `load_parameters` and do not retain the slice afterward (§6.1: "layers never allocate
/// persistent host memory for weights").
pub struct DataBlob<'a> {
    pub data: &'a [u8],
    pub element_count: usize,
    pub element_type: ParamElementType,
    pub quantization: Option<Quantization>,
}

/// Given `(layer_name, subkey, sublayer_index)`, returns the requested parameter blob.
///
/// `subkey` distinguishes a layer's several parameter roles (`"weights"`, `"bias"`,
/// `"scale"`, ...); `sublayer_index` addresses one sublayer of a layer that bundles several
/// (e.g. per-head attention weights), and is `0` for layers with no sublayer structure.
pub trait ParameterProvider {
    fn get(
        &self,
        layer_name: &str,
        subkey: &str,
        sublayer_index: usize,
    ) -> Result<DataBlob<'_>>;
}

/// Looks up a parameter and turns an absent entry into the crate's `param-missing` error kind,
/// the shape every `load_parameters` implementation needs.
pub fn require<'a>(
    provider: &'a dyn ParameterProvider,
    layer_name: &str,
    subkey: &str,
    sublayer_index: usize,
) -> Result<DataBlob<'a>> {
    provider.get(layer_name, subkey, sublayer_index).map_err(|err| match err {
        Error::ParamMissing(_) => err,
        _ => Error::ParamMissing(MissingParam {
            layer_name: layer_name.to_string(),
            subkey: subkey.to_string(),
            sublayer_index,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapProvider {
        blobs: HashMap<(String, String, usize), Vec<u8>>,
    }

    impl ParameterProvider for MapProvider {
        fn get(&self, layer_name: &str, subkey: &str, sublayer_index: usize) -> Result<DataBlob<'_>> {
            let key = (layer_name.to_string(), subkey.to_string(), sublayer_index);
            let data = self.blobs.get(&key).ok_or_else(|| {
                Error::ParamMissing(MissingParam {
                    layer_name: layer_name.to_string(),
                    subkey: subkey.to_string(),
                    sublayer_index,
                })
            })?;
            Ok(DataBlob {
                data,
                element_count: data.len(),
                element_type: ParamElementType::Uint8,
                quantization: None,
            })
        }
    }

    #[test]
    fn missing_param_reports_layer_subkey_and_index() {
        let provider = MapProvider {
            blobs: HashMap::new(),
        };
        let err = require(&provider, "conv1", "weights", 0).unwrap_err();
        match err {
            Error::ParamMissing(missing) => {
                assert_eq!(missing.layer_name, "conv1");
                assert_eq!(missing.subkey, "weights");
            }
            other => panic!("expected ParamMissing, got {other:?}"),
        }
    }
}
