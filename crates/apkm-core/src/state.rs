use std::{collections::BTreeMap, fs, io, path::Path};

use apkm_util::write_json_atomic;
use serde::{Deserialize, Serialize};

use crate::error::{ApkmError, ApkmResult};
use crate::resource::ResourceState;

/// Recorded resources, keyed by resource address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateFile {
    pub resources: BTreeMap<String, ResourceState>,
}

impl StateFile {
    /// A missing file is an empty state.
    pub fn load(path: &Path) -> ApkmResult<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ApkmError::StateIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&data).map_err(|source| ApkmError::StateParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> ApkmResult<()> {
        write_json_atomic(path, self).map_err(|source| ApkmError::StateIo {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, address: &str) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    /// Records `state` under `address`, or forgets the address when `None`.
    pub fn set(&mut self, address: &str, state: Option<ResourceState>) {
        match state {
            Some(state) => {
                self.resources.insert(address.to_string(), state);
            }
            None => {
                self.resources.remove(address);
            }
        }
    }
}
