//! The parameter schema: a read-only dictionary mapping parameter ids to
//! their name, unit and on-wire representation.
//!
//! The schema is built once at startup from a network configuration
//! document (YAML). Only the fields relevant to decoding are consumed;
//! everything else in the document is ignored.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, BE};
use serde::Deserialize;
use tracing::{info, warn};

/// The on-wire representation of a parameter's value. All integer types
/// are big-endian with their declared signedness; `F32` is IEEE-754
/// big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
}

impl WireType {
    /// Number of payload bytes this type occupies on the wire.
    pub fn size(self) -> usize {
        match self {
            WireType::U8 | WireType::S8 => 1,
            WireType::U16 | WireType::S16 => 2,
            WireType::U32 | WireType::S32 | WireType::F32 => 4,
            WireType::U64 | WireType::S64 => 8,
        }
    }

    pub fn signed(self) -> bool {
        matches!(
            self,
            WireType::S8 | WireType::S16 | WireType::S32 | WireType::S64 | WireType::F32
        )
    }

    /// Translates the network configuration's type spelling, if known.
    fn from_config(name: &str) -> Option<Self> {
        Some(match name {
            "UNSIGNED8" => WireType::U8,
            "UNSIGNED16" => WireType::U16,
            "UNSIGNED32" => WireType::U32,
            "UNSIGNED64" => WireType::U64,
            "SIGNED8" => WireType::S8,
            "SIGNED16" => WireType::S16,
            "SIGNED32" => WireType::S32,
            "SIGNED64" => WireType::S64,
            "FLOATING" => WireType::F32,
            _ => return None,
        })
    }

    /// Decodes a payload of exactly [`WireType::size`] bytes, widened to
    /// `f64` for storage.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is not exactly [`WireType::size`] bytes long;
    /// the frame decoder checks the length before calling.
    pub(crate) fn decode(self, payload: &[u8]) -> f64 {
        debug_assert_eq!(payload.len(), self.size());
        match self {
            WireType::U8 => payload[0] as f64,
            WireType::U16 => BE::read_u16(payload) as f64,
            WireType::U32 => BE::read_u32(payload) as f64,
            WireType::U64 => BE::read_u64(payload) as f64,
            WireType::S8 => payload[0] as i8 as f64,
            WireType::S16 => BE::read_i16(payload) as f64,
            WireType::S32 => BE::read_i32(payload) as f64,
            WireType::S64 => BE::read_i64(payload) as f64,
            WireType::F32 => BE::read_f32(payload) as f64,
        }
    }
}

/// A single parameter definition. Immutable after schema construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub id: u16,
    pub name: String,
    pub unit: String,
    pub wire_type: WireType,
}

/// A network configuration document, as parsed from YAML. Produced by an
/// external tool; only consumed as data here.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub parameters: BTreeMap<String, ParameterConfig>,
}

/// One `parameters:` entry of a [`NetworkConfig`]. Unknown fields in the
/// document are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterConfig {
    pub id: Option<u32>,
    #[serde(rename = "type")]
    pub wire_type: Option<String>,
    pub motec_name: Option<String>,
    pub unit: Option<String>,
}

/// Errors that can occur while loading a schema from disk.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_norway::Error),
    #[error("configuration contains no usable parameters")]
    NoParameters,
}

/// The parameter dictionary: `id -> Parameter`. Read-only after
/// construction.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    parameters: BTreeMap<u16, Parameter>,
}

impl Schema {
    /// Builds a schema from an already-parsed configuration document.
    ///
    /// Entries with a missing id, an unknown type, or a duplicate id are
    /// logged and skipped.
    pub fn from_config(config: &NetworkConfig) -> Schema {
        let mut parameters = BTreeMap::new();
        for (key, param) in &config.parameters {
            let id = match param.id.map(u16::try_from) {
                Some(Ok(id)) => id,
                Some(Err(_)) => {
                    warn!("{} has an out-of-range id ({})", key, param.id.unwrap());
                    continue;
                }
                None => {
                    warn!("{} is missing an id", key);
                    continue;
                }
            };
            if parameters.contains_key(&id) {
                warn!("duplicate id ({})", id);
                continue;
            }
            let wire_type = match param.wire_type.as_deref().and_then(WireType::from_config) {
                Some(t) => t,
                None => {
                    warn!(
                        "{} has an unknown type ({})",
                        key,
                        param.wire_type.as_deref().unwrap_or("")
                    );
                    continue;
                }
            };
            parameters.insert(
                id,
                Parameter {
                    id,
                    name: param.motec_name.clone().unwrap_or_default(),
                    unit: param.unit.clone().unwrap_or_default(),
                    wire_type,
                },
            );
        }
        info!("found {} parameters", parameters.len());
        Schema { parameters }
    }

    /// Reads and parses a network configuration from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Schema, SchemaError> {
        let text = fs::read_to_string(path)?;
        let config: NetworkConfig = serde_norway::from_str(&text)?;
        let schema = Schema::from_config(&config);
        if schema.is_empty() {
            return Err(SchemaError::NoParameters);
        }
        Ok(schema)
    }

    pub fn get(&self, id: u16) -> Option<&Parameter> {
        self.parameters.get(&id)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Iterates over parameters in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
parameters:
  engine_rpm:
    id: 1
    type: UNSIGNED16
    motec_name: Engine RPM
    unit: rpm
  oil_pressure:
    id: 2
    type: FLOATING
    motec_name: Oil Pressure
    unit: kPa
  oil_pressure_copy:
    id: 2
    type: FLOATING
  bad_type:
    id: 3
    type: COMPLEX128
  no_id:
    type: UNSIGNED8
"#;

    #[test]
    fn config_skip_rules() {
        let config: NetworkConfig = serde_norway::from_str(CONFIG).unwrap();
        let schema = Schema::from_config(&config);

        assert_eq!(schema.len(), 2);
        assert_eq!(schema.get(1).unwrap().name, "Engine RPM");
        assert_eq!(schema.get(1).unwrap().wire_type, WireType::U16);
        assert_eq!(schema.get(2).unwrap().unit, "kPa");
        assert!(schema.get(3).is_none());
    }

    #[test]
    fn wire_type_sizes() {
        for (t, size) in [
            (WireType::U8, 1),
            (WireType::S16, 2),
            (WireType::U32, 4),
            (WireType::F32, 4),
            (WireType::S64, 8),
        ]
        .iter()
        {
            assert_eq!(t.size(), *size);
        }
    }

    #[test]
    fn decode_widens_to_f64() {
        assert_eq!(WireType::U8.decode(&[0x7E]), 126.0);
        assert_eq!(WireType::S16.decode(&[0xFF, 0xFE]), -2.0);
        assert_eq!(WireType::U32.decode(&[0x00, 0x01, 0x00, 0x00]), 65536.0);
        assert_eq!(WireType::S8.decode(&[0x80]), -128.0);
        assert_eq!(WireType::F32.decode(&[0x3F, 0x80, 0x00, 0x00]), 1.0);
        assert_eq!(
            WireType::U64.decode(&[0, 0, 0, 1, 0, 0, 0, 0]),
            4294967296.0
        );
    }
}
