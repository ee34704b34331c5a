//! File-configured transform pipelines.
//!
//! A pipeline is a TOML file with an ordered list of stages:
//!
//! ```toml
//! max_output_bytes = 65536
//!
//! [[stages]]
//! kind = "replace"
//! direction = "inbound"
//! find = "Host: internal"
//! replace = "Host: public"
//!
//! [[stages]]
//! kind = "replace"
//! find = { hex = "00ff" }
//! replace = { hex = "0000" }
//!
//! [[stages]]
//! kind = "fuzz"
//! direction = "outbound"
//! max_modifications = 2
//! modifiers = ["change", "delete"]
//! probability = 0.05
//!
//! [[stages]]
//! kind = "log"
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::fuzz::{Fuzzer, Modifier};
use super::{Direction, TransformHook};
use crate::error::{PipelineError, TransformError};

/// Bytes of each chunk shown by the `log` stage.
const LOG_PREVIEW_BYTES: usize = 32;

/// Which directions a stage applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDirection {
    Inbound,
    Outbound,
    #[default]
    Both,
}

impl StageDirection {
    fn matches(self, direction: Direction) -> bool {
        match self {
            StageDirection::Both => true,
            StageDirection::Inbound => direction == Direction::Inbound,
            StageDirection::Outbound => direction == Direction::Outbound,
        }
    }
}

/// A byte string in a pipeline file: plain text, or `{ hex = "..." }` for
/// bytes that are not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BytePattern {
    Text(String),
    Hex { hex: String },
}

impl BytePattern {
    fn decode(self) -> Result<Vec<u8>, String> {
        match self {
            BytePattern::Text(text) => Ok(text.into_bytes()),
            BytePattern::Hex { hex } => {
                hex::decode(&hex).map_err(|e| format!("invalid hex '{hex}': {e}"))
            }
        }
    }
}

/// On-disk pipeline description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Fail the transform when a chunk grows beyond this many bytes.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One pipeline stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Replace {
        #[serde(default)]
        direction: StageDirection,
        find: BytePattern,
        replace: BytePattern,
    },
    Fuzz {
        #[serde(default)]
        direction: StageDirection,
        #[serde(default = "default_max_modifications")]
        max_modifications: usize,
        #[serde(default)]
        modifiers: Vec<Modifier>,
        #[serde(default = "default_probability")]
        probability: f64,
        #[serde(default)]
        seed: Option<u64>,
    },
    Log {
        #[serde(default)]
        direction: StageDirection,
    },
}

fn default_max_modifications() -> usize {
    1
}

fn default_probability() -> f64 {
    1.0
}

#[derive(Debug)]
enum Stage {
    Replace { find: Vec<u8>, replace: Vec<u8> },
    Fuzz { fuzzer: Fuzzer, probability: f64 },
    Log,
}

/// An ordered list of stages, usable as a [`TransformHook`].
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<(StageDirection, Stage)>,
    max_output_bytes: Option<usize>,
}

impl Pipeline {
    /// Load a pipeline from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a pipeline from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = toml::from_str(contents)?;
        Self::from_config(config)
    }

    /// Build a pipeline from an already-parsed description.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let mut stages = Vec::with_capacity(config.stages.len());

        for (index, stage) in config.stages.into_iter().enumerate() {
            let built = match stage {
                StageConfig::Replace {
                    direction,
                    find,
                    replace,
                } => {
                    let invalid = |reason| PipelineError::Invalid { index, reason };
                    let find = find.decode().map_err(invalid)?;
                    let replace = replace.decode().map_err(invalid)?;
                    if find.is_empty() {
                        return Err(invalid(
                            "replace stage needs a non-empty `find`".to_string(),
                        ));
                    }
                    (direction, Stage::Replace { find, replace })
                }
                StageConfig::Fuzz {
                    direction,
                    max_modifications,
                    modifiers,
                    probability,
                    seed,
                } => {
                    if !(0.0..=1.0).contains(&probability) {
                        return Err(PipelineError::Invalid {
                            index,
                            reason: format!("fuzz probability {probability} is outside 0.0-1.0"),
                        });
                    }
                    (
                        direction,
                        Stage::Fuzz {
                            fuzzer: Fuzzer::new(max_modifications, modifiers, seed),
                            probability,
                        },
                    )
                }
                StageConfig::Log { direction } => (direction, Stage::Log),
            };
            stages.push(built);
        }

        Ok(Self {
            stages,
            max_output_bytes: config.max_output_bytes,
        })
    }

    /// Number of configured stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl TransformHook for Pipeline {
    fn transform(&self, direction: Direction, chunk: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut data = chunk.to_vec();

        for (applies_to, stage) in &self.stages {
            if !applies_to.matches(direction) {
                continue;
            }
            match stage {
                Stage::Replace { find, replace } => {
                    data = replace_all(&data, find, replace);
                }
                Stage::Fuzz {
                    fuzzer,
                    probability,
                } => {
                    if *probability >= 1.0 || fuzzer.sample() < *probability {
                        fuzzer.fuzz(&mut data);
                    }
                }
                Stage::Log => {
                    let preview = &data[..data.len().min(LOG_PREVIEW_BYTES)];
                    debug!(
                        direction = %direction,
                        len = data.len(),
                        preview = %hex::encode(preview),
                        "Chunk"
                    );
                }
            }
        }

        if let Some(max) = self.max_output_bytes {
            if data.len() > max {
                return Err(TransformError::OutputTooLarge {
                    len: data.len(),
                    max,
                });
            }
        }

        Ok(data)
    }
}

fn replace_all(haystack: &[u8], find: &[u8], replace: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(find) {
            out.extend_from_slice(replace);
            i += find.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}
