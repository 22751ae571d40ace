//! Machine configuration

use serde::Deserialize;

/// Parameters of the simulated platform.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Page size in bytes (power of two, at least 4096)
    pub page_size: u64,
    /// Maximum number of pages mapped at once, host stack included
    pub memory_pages: u64,
    /// Pages in the host (caller) stack mapped at reset
    pub host_stack_pages: u64,
    /// Whether the auxiliary vector carries the sealing root
    pub expose_seal_root: bool,
    /// Whether the auxiliary vector carries the compartment identity root
    pub expose_cid_root: bool,
    /// Instructions executed per host call before giving up
    pub max_steps: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            memory_pages: 1024,
            host_stack_pages: 4,
            expose_seal_root: true,
            expose_cid_root: true,
            max_steps: 100_000,
        }
    }
}
