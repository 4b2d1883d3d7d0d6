//! Per-field decoders turning protocol values into typed frame fields.
//!
//! Byte buffers are little-endian and must be a whole number of elements;
//! a trailing partial element is an error, never truncated. Numeric lists
//! are accepted in place of byte buffers.

use std::{collections::HashMap, fmt, sync::Arc};

use network_shared::{Value, protocol::keys::frame as fields};
use thiserror::Error;

use super::FieldValue;

/// What went wrong decoding one value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeFault {
    #[error("expected {expected}, got {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{len} bytes is not a multiple of the {stride}-byte element")]
    Stride { len: usize, stride: usize },
    #[error("{len} values is not a multiple of {stride}")]
    Arity { len: usize, stride: usize },
    #[error("expected {expected} values, got {found}")]
    Length { expected: usize, found: usize },
    #[error("element {index} is out of range")]
    OutOfRange { index: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot decode field {field}: {fault}")]
pub struct DecodeError {
    pub field: String,
    #[source]
    pub fault: DecodeFault,
}

/// Pure conversion of one raw field value.
pub type Decoder = Arc<dyn Fn(&Value) -> Result<FieldValue, DecodeFault> + Send + Sync>;

/// Field id → decoder. Fields without a decoder pass through as [`FieldValue::Raw`].
#[derive(Clone, Default)]
pub struct DecoderTable {
    decoders: HashMap<String, Decoder>,
}

impl DecoderTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decoders for the standard particle/residue/chain/bond schema.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for field in [fields::PARTICLE_COUNT, fields::RESIDUE_COUNT, fields::CHAIN_COUNT] {
            table.register(field, decode_int);
        }
        table.register(fields::PARTICLE_POSITIONS, decode_vector3_array);
        table.register(fields::PARTICLE_ELEMENTS, decode_element_array);
        for field in [fields::PARTICLE_RESIDUES, fields::RESIDUE_CHAINS] {
            table.register(field, decode_u32_array);
        }
        for field in [fields::PARTICLE_NAMES, fields::RESIDUE_NAMES, fields::CHAIN_NAMES] {
            table.register(field, decode_string_array);
        }
        table.register(fields::BOND_PAIRS, decode_bond_array);
        table.register(fields::BOND_ORDERS, decode_f32_array);
        table.register(fields::BOX_VECTORS, decode_linear_transformation);
        table
    }

    /// Adds or replaces the decoder for `field`.
    pub fn register<F>(&mut self, field: impl Into<String>, decoder: F)
    where
        F: Fn(&Value) -> Result<FieldValue, DecodeFault> + Send + Sync + 'static,
    {
        self.decoders.insert(field.into(), Arc::new(decoder));
    }

    pub fn contains(&self, field: &str) -> bool {
        self.decoders.contains_key(field)
    }

    pub fn decode(&self, field: &str, raw: &Value) -> Result<FieldValue, DecodeError> {
        match self.decoders.get(field) {
            Some(decoder) => decoder(raw).map_err(|fault| DecodeError {
                field: field.to_owned(),
                fault,
            }),
            None => Ok(FieldValue::Raw(raw.clone())),
        }
    }
}

impl fmt::Debug for DecoderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<_> = self.decoders.keys().collect();
        fields.sort();
        f.debug_struct("DecoderTable").field("fields", &fields).finish()
    }
}

fn wrong_kind(expected: &'static str, found: &Value) -> DecodeFault {
    DecodeFault::WrongKind {
        expected,
        found: found.kind(),
    }
}

fn check_stride(bytes: &[u8], stride: usize) -> Result<(), DecodeFault> {
    if bytes.len() % stride == 0 {
        Ok(())
    } else {
        Err(DecodeFault::Stride {
            len: bytes.len(),
            stride,
        })
    }
}

/// Splits a byte buffer into `STRIDE`-sized chunks, rejecting partial elements.
fn chunks<const STRIDE: usize>(
    bytes: &[u8],
) -> Result<impl Iterator<Item = [u8; STRIDE]> + '_, DecodeFault> {
    check_stride(bytes, STRIDE)?;
    Ok(bytes.chunks_exact(STRIDE).map(|chunk| {
        let mut element = [0u8; STRIDE];
        element.copy_from_slice(chunk);
        element
    }))
}

fn numbers(items: &[Value]) -> Result<Vec<f64>, DecodeFault> {
    items
        .iter()
        .map(|item| item.as_f64().ok_or_else(|| wrong_kind("number", item)))
        .collect()
}

fn integers(items: &[Value]) -> Result<Vec<u32>, DecodeFault> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let n = item.as_i64().ok_or_else(|| wrong_kind("integer", item))?;
            u32::try_from(n).map_err(|_| DecodeFault::OutOfRange { index })
        })
        .collect()
}

fn f32s(raw: &Value) -> Result<Vec<f32>, DecodeFault> {
    match raw {
        Value::Bytes(bytes) => Ok(chunks::<4>(bytes)?.map(f32::from_le_bytes).collect()),
        Value::List(items) => Ok(numbers(items)?.into_iter().map(|n| n as f32).collect()),
        other => Err(wrong_kind("bytes or number list", other)),
    }
}

fn u32s(raw: &Value) -> Result<Vec<u32>, DecodeFault> {
    match raw {
        Value::Bytes(bytes) => Ok(chunks::<4>(bytes)?.map(u32::from_le_bytes).collect()),
        Value::List(items) => integers(items),
        other => Err(wrong_kind("bytes or integer list", other)),
    }
}

fn grouped<T: Copy + Default, const N: usize>(flat: Vec<T>) -> Result<Vec<[T; N]>, DecodeFault> {
    if flat.len() % N != 0 {
        return Err(DecodeFault::Arity {
            len: flat.len(),
            stride: N,
        });
    }
    Ok(flat
        .chunks_exact(N)
        .map(|chunk| {
            let mut group = [T::default(); N];
            group.copy_from_slice(chunk);
            group
        })
        .collect())
}

pub fn decode_int(raw: &Value) -> Result<FieldValue, DecodeFault> {
    raw.as_i64()
        .map(FieldValue::Int)
        .ok_or_else(|| wrong_kind("integer", raw))
}

pub fn decode_f32_array(raw: &Value) -> Result<FieldValue, DecodeFault> {
    f32s(raw).map(FieldValue::Float32Array)
}

pub fn decode_u32_array(raw: &Value) -> Result<FieldValue, DecodeFault> {
    u32s(raw).map(FieldValue::UInt32Array)
}

pub fn decode_vector3_array(raw: &Value) -> Result<FieldValue, DecodeFault> {
    if let Value::Bytes(bytes) = raw {
        // Stride of a whole vector, not of one component.
        check_stride(bytes, 12)?;
    }
    grouped::<f32, 3>(f32s(raw)?).map(FieldValue::Vector3Array)
}

pub fn decode_bond_array(raw: &Value) -> Result<FieldValue, DecodeFault> {
    if let Value::Bytes(bytes) = raw {
        check_stride(bytes, 8)?;
    }
    grouped::<u32, 2>(u32s(raw)?).map(FieldValue::BondArray)
}

pub fn decode_element_array(raw: &Value) -> Result<FieldValue, DecodeFault> {
    match raw {
        Value::Bytes(bytes) => Ok(FieldValue::ElementArray(bytes.to_vec())),
        Value::List(items) => integers(items)?
            .into_iter()
            .enumerate()
            .map(|(index, n)| u8::try_from(n).map_err(|_| DecodeFault::OutOfRange { index }))
            .collect::<Result<Vec<_>, _>>()
            .map(FieldValue::ElementArray),
        other => Err(wrong_kind("bytes or integer list", other)),
    }
}

pub fn decode_string_array(raw: &Value) -> Result<FieldValue, DecodeFault> {
    let items = raw.as_list().ok_or_else(|| wrong_kind("string list", raw))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| wrong_kind("string", item))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(FieldValue::StringArray)
}

pub fn decode_linear_transformation(raw: &Value) -> Result<FieldValue, DecodeFault> {
    let flat = f32s(raw)?;
    if flat.len() != 9 {
        return Err(DecodeFault::Length {
            expected: 9,
            found: flat.len(),
        });
    }
    let mut vectors = [[0.0f32; 3]; 3];
    for (vector, chunk) in vectors.iter_mut().zip(flat.chunks_exact(3)) {
        vector.copy_from_slice(chunk);
    }
    Ok(FieldValue::LinearTransformation(vectors))
}
