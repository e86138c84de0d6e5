//! Layout schema descriptor
//!
//! A pool records, at creation time, which object types it may contain. The
//! descriptor is serialized into the header and compared on every open, so a
//! program expecting one object graph never reinterprets another's bytes.

use serde::{Deserialize, Serialize};

use crate::error::{PmkvError, Result};

/// Max length of a layout name
pub const MAX_LAYOUT_LEN: usize = 64;

/// Max alignment a type may request (block payloads are 8-byte aligned)
pub const MAX_TYPE_ALIGN: u64 = 8;

/// Identifies the type of a persistent object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Tag carried by the null reference; never valid for an allocation
    pub const NONE: TypeTag = TypeTag(0);
}

/// Size and alignment of one object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDesc {
    pub tag: TypeTag,
    pub name: String,
    /// Smallest size an allocation of this type may request
    pub min_size: u64,
    pub align: u64,
}

/// The set of types a pool layout may contain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Layout name, e.g. "pmkv-hashmap"
    pub layout: String,

    /// Version of the object graph under this layout name
    pub version: u32,

    pub types: Vec<TypeDesc>,
}

impl Schema {
    /// Create an empty schema for a layout
    pub fn new(layout: impl Into<String>, version: u32) -> Self {
        Self {
            layout: layout.into(),
            version,
            types: Vec::new(),
        }
    }

    /// Declare an object type
    pub fn with_type(
        mut self,
        tag: TypeTag,
        name: impl Into<String>,
        min_size: u64,
        align: u64,
    ) -> Self {
        self.types.push(TypeDesc {
            tag,
            name: name.into(),
            min_size,
            align,
        });
        self
    }

    /// Look up a declared type
    pub fn describe(&self, tag: TypeTag) -> Option<&TypeDesc> {
        self.types.iter().find(|t| t.tag == tag)
    }

    /// Check the descriptor can be stored in a pool
    pub fn validate(&self) -> Result<()> {
        if self.layout.is_empty() || self.layout.len() > MAX_LAYOUT_LEN {
            return Err(PmkvError::InvalidArgument(format!(
                "layout name must be 1..={} bytes, got {}",
                MAX_LAYOUT_LEN,
                self.layout.len()
            )));
        }

        for (i, desc) in self.types.iter().enumerate() {
            if desc.tag == TypeTag::NONE {
                return Err(PmkvError::InvalidArgument(format!(
                    "type {:?} uses the reserved tag 0",
                    desc.name
                )));
            }
            if !desc.align.is_power_of_two() || desc.align > MAX_TYPE_ALIGN {
                return Err(PmkvError::InvalidArgument(format!(
                    "type {:?} alignment {} must be a power of two <= {}",
                    desc.name, desc.align, MAX_TYPE_ALIGN
                )));
            }
            if self.types[..i].iter().any(|t| t.tag == desc.tag) {
                return Err(PmkvError::InvalidArgument(format!(
                    "duplicate type tag {}",
                    desc.tag.0
                )));
            }
        }

        Ok(())
    }

    /// Compare against the schema found in a pool
    pub(crate) fn expect_matches(&self, found: &Schema) -> Result<()> {
        if self == found {
            return Ok(());
        }

        if self.layout != found.layout {
            return Err(PmkvError::LayoutMismatch {
                expected: self.layout.clone(),
                found: found.layout.clone(),
            });
        }

        Err(PmkvError::LayoutMismatch {
            expected: format!("{} v{} ({} types)", self.layout, self.version, self.types.len()),
            found: format!("{} v{} ({} types)", found.layout, found.version, found.types.len()),
        })
    }
}
