//! Immutable trajectory frames and incremental assembly.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use network_shared::{Value, protocol::keys::frame as fields};

pub mod assembler;
pub mod decode;

pub use assembler::FrameAssembler;
pub use decode::{DecodeError, DecodeFault, Decoder, DecoderTable};

/// Decoded value of one frame field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// No decoder registered; the protocol value as received.
    Raw(Value),
    Int(i64),
    Float32Array(Vec<f32>),
    UInt32Array(Vec<u32>),
    Vector3Array(Vec<[f32; 3]>),
    BondArray(Vec<[u32; 2]>),
    /// Atomic numbers.
    ElementArray(Vec<u8>),
    StringArray(Vec<String>),
    /// Three basis vectors, e.g. of the periodic box.
    LinearTransformation([[f32; 3]; 3]),
}

/// A snapshot of every known field. Published frames are never mutated;
/// a successor shares the values it did not overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    fields: BTreeMap<String, Arc<FieldValue>>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).map(Arc::as_ref)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_ids(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// True if both frames hold the very same value allocation for `field`.
    pub fn shares_field(&self, other: &Frame, field: &str) -> bool {
        match (self.fields.get(field), other.fields.get(field)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn insert(&mut self, field: String, value: FieldValue) {
        self.fields.insert(field, Arc::new(value));
    }

    pub fn particle_count(&self) -> Option<i64> {
        match self.get(fields::PARTICLE_COUNT)? {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn particle_positions(&self) -> Option<&[[f32; 3]]> {
        match self.get(fields::PARTICLE_POSITIONS)? {
            FieldValue::Vector3Array(positions) => Some(positions),
            _ => None,
        }
    }

    pub fn particle_elements(&self) -> Option<&[u8]> {
        match self.get(fields::PARTICLE_ELEMENTS)? {
            FieldValue::ElementArray(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn bond_pairs(&self) -> Option<&[[u32; 2]]> {
        match self.get(fields::BOND_PAIRS)? {
            FieldValue::BondArray(bonds) => Some(bonds),
            _ => None,
        }
    }

    pub fn box_vectors(&self) -> Option<&[[f32; 3]; 3]> {
        match self.get(fields::BOX_VECTORS)? {
            FieldValue::LinearTransformation(vectors) => Some(vectors),
            _ => None,
        }
    }
}

/// Which fields the latest update touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameChanges {
    /// Set by a reset: every field must be treated as changed.
    pub all: bool,
    pub fields: BTreeSet<String>,
}

impl FrameChanges {
    pub fn everything() -> Self {
        Self {
            all: true,
            fields: BTreeSet::new(),
        }
    }

    pub fn has_changed(&self, field: &str) -> bool {
        self.all || self.fields.contains(field)
    }

    pub fn has_any_changed(&self) -> bool {
        self.all || !self.fields.is_empty()
    }

    pub fn mark(&mut self, field: impl Into<String>) {
        self.fields.insert(field.into());
    }

    /// Folds a later change set into this one.
    pub fn merge(&mut self, later: &FrameChanges) {
        self.all |= later.all;
        self.fields.extend(later.fields.iter().cloned());
    }
}
