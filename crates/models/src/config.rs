//! Hierarchical model configuration (`MODEL.PVT.*`, `MODEL.ROI_BOX_HEAD.*`, ...).
//!
//! Files are TOML with the upper-case section/key names of the detection
//! config schema. Keys missing from a file keep their defaults; keys the
//! schema does not know are ignored when loading a file but rejected when
//! passed as command-line overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{ModelError, ModelResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FctConfig {
    #[serde(rename = "MODEL")]
    pub model: ModelSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ModelSection {
    pub pvt: PvtConfig,
    pub roi_box_head: RoiBoxHeadSection,
    pub fpn: FpnSection,
}

/// Hyperparameters of a staged pyramid vision transformer.
///
/// All sequence fields are indexed by pyramid level and must share one length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PvtConfig {
    pub depths: Vec<usize>,
    pub embed_dims: Vec<usize>,
    pub num_heads: Vec<usize>,
    pub sr_ratios: Vec<usize>,
    pub mlp_ratios: Vec<f64>,
    pub qkv_bias: bool,
    pub linear: bool,
    pub proj_drop_rate: f64,
    pub attn_drop_rate: f64,
    pub drop_path_rate: f64,
    pub norm_layer: String,
}

impl Default for PvtConfig {
    fn default() -> Self {
        Self {
            depths: vec![3, 4, 6, 3],
            embed_dims: vec![64, 128, 256, 512],
            num_heads: vec![1, 2, 4, 8],
            sr_ratios: vec![8, 4, 2, 1],
            mlp_ratios: vec![8.0, 8.0, 4.0, 4.0],
            qkv_bias: true,
            linear: false,
            proj_drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.0,
            norm_layer: "LN".to_string(),
        }
    }
}

impl PvtConfig {
    pub fn num_levels(&self) -> usize {
        self.depths.len()
    }

    /// Index of the deepest configured pyramid level.
    pub fn last_level(&self) -> ModelResult<usize> {
        self.num_levels()
            .checked_sub(1)
            .ok_or_else(|| ModelError::config("MODEL.PVT.DEPTHS must not be empty"))
    }

    pub fn validate(&self) -> ModelResult<()> {
        let levels = self.num_levels();
        if levels == 0 {
            return Err(ModelError::config("MODEL.PVT.DEPTHS must not be empty"));
        }
        let lengths = [
            ("EMBED_DIMS", self.embed_dims.len()),
            ("NUM_HEADS", self.num_heads.len()),
            ("SR_RATIOS", self.sr_ratios.len()),
            ("MLP_RATIOS", self.mlp_ratios.len()),
        ];
        for (key, len) in lengths {
            if len != levels {
                return Err(ModelError::config(format!(
                    "MODEL.PVT.{key} has {len} entries but DEPTHS has {levels}"
                )));
            }
        }
        for level in 0..levels {
            let (dim, heads) = (self.embed_dims[level], self.num_heads[level]);
            if heads == 0 || dim == 0 || dim % heads != 0 {
                return Err(ModelError::config(format!(
                    "level {level}: EMBED_DIMS {dim} is not divisible by NUM_HEADS {heads}"
                )));
            }
            if self.sr_ratios[level] == 0 {
                return Err(ModelError::config(format!(
                    "level {level}: SR_RATIOS must be at least 1"
                )));
            }
            let ratio = self.mlp_ratios[level];
            if !(ratio.is_finite() && ratio > 0.0) {
                return Err(ModelError::config(format!(
                    "level {level}: MLP_RATIOS must be positive, got {ratio}"
                )));
            }
        }
        let rates = [
            ("PROJ_DROP_RATE", self.proj_drop_rate),
            ("ATTN_DROP_RATE", self.attn_drop_rate),
            ("DROP_PATH_RATE", self.drop_path_rate),
        ];
        for (key, rate) in rates {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::config(format!(
                    "MODEL.PVT.{key} must be within [0, 1), got {rate}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RoiBoxHeadSection {
    /// Registry key of the box head to build.
    pub name: String,
    pub pooler_resolution: usize,
}

impl Default for RoiBoxHeadSection {
    fn default() -> Self {
        Self {
            name: "PVT4BoxHead".to_string(),
            pooler_resolution: 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FpnSection {
    pub out_channels: usize,
}

impl Default for FpnSection {
    fn default() -> Self {
        Self { out_channels: 256 }
    }
}

impl FctConfig {
    pub fn from_toml_str(raw: &str) -> ModelResult<Self> {
        let table: toml::Table = toml::from_str(raw)?;
        Ok(Value::Table(table).try_into()?)
    }

    pub fn from_path(path: &Path) -> ModelResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load an optional config file, then apply `KEY VALUE` overrides.
    pub fn load(path: Option<&Path>, overrides: &[String]) -> ModelResult<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        cfg.merge_from_list(overrides)?;
        Ok(cfg)
    }

    /// Apply overrides given as a flat `[KEY, VALUE, KEY, VALUE, ...]` list.
    ///
    /// Keys are dotted paths (`MODEL.PVT.DEPTHS`); values are parsed as TOML
    /// and fall back to plain strings.
    pub fn merge_from_list(&mut self, overrides: &[String]) -> ModelResult<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        if overrides.len() % 2 != 0 {
            return Err(ModelError::config(format!(
                "overrides must be KEY VALUE pairs, got {} items",
                overrides.len()
            )));
        }
        let mut root = to_value(self)?;
        for pair in overrides.chunks(2) {
            set_dotted(&mut root, &pair[0], parse_override(&pair[1]))?;
        }
        *self = root.try_into()?;
        Ok(())
    }
}

fn to_value(cfg: &FctConfig) -> ModelResult<Value> {
    Value::try_from(cfg).map_err(|e| ModelError::config(format!("unserializable config: {e}")))
}

fn parse_override(raw: &str) -> Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn set_dotted(root: &mut Value, key: &str, value: Value) -> ModelResult<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts.pop().filter(|s| !s.is_empty());
    let Some(leaf) = leaf else {
        return Err(ModelError::config(format!("empty config key {key:?}")));
    };
    let mut node = root;
    for part in parts {
        node = node
            .get_mut(part)
            .filter(|v| v.is_table())
            .ok_or_else(|| ModelError::config(format!("non-existent config key: {key}")))?;
    }
    let table = node
        .as_table_mut()
        .ok_or_else(|| ModelError::config(format!("non-existent config key: {key}")))?;
    match table.get_mut(leaf) {
        Some(slot) if !slot.is_table() => {
            *slot = value;
            Ok(())
        }
        Some(_) => Err(ModelError::config(format!(
            "config key {key} is a section and cannot be overridden"
        ))),
        None => Err(ModelError::config(format!("non-existent config key: {key}"))),
    }
}
