use crate::{Error, PatchDirective, PatchPlan, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// A byte sequence written either as a UTF-8 string or as an array of bytes.
///
/// ```json
/// "Klustered"
/// [75, 108, 117, 115, 0]
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ByteSpec {
    Text(String),
    Bytes(Vec<u8>),
}

impl ByteSpec {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ByteSpec::Text(text) => text.as_bytes(),
            ByteSpec::Bytes(bytes) => bytes,
        }
    }
}

/// `DirectiveConfig` is the on-disk form of a `PatchDirective`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DirectiveConfig {
    pub target: ByteSpec,
    pub replacement: ByteSpec,
    #[serde(default)]
    pub allow_overrun: bool,
}

/// `PatchConfig` is the on-disk form of a `PatchPlan`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PatchConfig {
    /// File name of the binaries to inspect
    pub binary: String,
    /// Bytes identifying a binary as one to patch
    pub trigger: ByteSpec,
    /// Edits applied in order to every triggered binary
    pub directives: Vec<DirectiveConfig>,
}

impl PatchConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(Error::OpenConfig)?;

        serde_json::from_reader(BufReader::new(file)).map_err(Error::ParseConfig)
    }

    /// Check the configuration and turn it into a plan.
    pub fn into_plan(self) -> Result<PatchPlan> {
        if self.binary.is_empty() || self.binary.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "binary must be a plain file name, got {:?}",
                self.binary
            )));
        }
        if self.trigger.as_bytes().is_empty() {
            return Err(Error::InvalidConfig("trigger must not be empty".to_string()));
        }
        if self.directives.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one directive is required".to_string(),
            ));
        }

        let directives = self
            .directives
            .into_iter()
            .enumerate()
            .map(|(i, directive)| {
                if directive.target.as_bytes().is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "directive {} has an empty target",
                        i
                    )));
                }
                Ok(PatchDirective {
                    target: directive.target.as_bytes().to_vec(),
                    replacement: directive.replacement.as_bytes().to_vec(),
                    allow_overrun: directive.allow_overrun,
                })
            })
            .collect::<Result<Vec<PatchDirective>>>()?;

        Ok(PatchPlan {
            binary: self.binary,
            trigger: self.trigger.as_bytes().to_vec(),
            directives,
        })
    }
}
