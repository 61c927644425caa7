use serde::{Deserialize, Serialize};

use crate::cc::gather::GatherGeometry;

/// A gather run described in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub schema_version: u32,
    #[serde(default)]
    pub meta: Option<ScenarioMeta>,
    pub comm: CommSpec,
    #[serde(default)]
    pub link: Option<LinkSpec>,
    #[serde(default)]
    pub payload: Option<PayloadMode>,
    /// Upper bound on registered public memory across all ranks.
    #[serde(default)]
    pub public_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommSpec {
    pub nproc: usize,
    #[serde(default)]
    pub root: usize,
    #[serde(default = "default_nelems")]
    pub nelems: usize,
    #[serde(default = "default_elem_size")]
    pub elem_size: usize,
}

fn default_nelems() -> usize {
    1
}

fn default_elem_size() -> usize {
    8
}

impl CommSpec {
    pub fn geometry(&self) -> GatherGeometry {
        GatherGeometry {
            nproc: self.nproc,
            root: self.root,
            nelems: self.nelems,
            elem_size: self.elem_size,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkSpec {
    #[serde(default)]
    pub latency_us: Option<u64>,
    #[serde(default)]
    pub gbps: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// Every rank contributes deterministic bytes; the result is checked.
    #[default]
    Synthetic,
    /// No rank registers memory; only message sizes and timing are modeled.
    TimingOnly,
}
