//! Manager configuration

use serde::Deserialize;

/// How compartment handles are sealed.
///
/// Every compartment of one manager uses the same scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealingScheme {
    /// Load-pair-and-branch: the handle points at `[data, code]` and is
    /// invoked with `ldpblr c9, [handle]`
    #[default]
    Lpb,
    /// Load-and-branch: the handle points at the code pointer and is invoked
    /// with `blr [handle, #0]`
    Lb,
}

/// Manager-wide settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub scheme: SealingScheme,
}

/// Per-compartment privileges. The default grants none of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompartmentFlags {
    /// Keep SYS_REG on the target so it may access privileged system
    /// registers
    pub allow_privileged_register_access: bool,
    /// Keep STORE_LOCAL_CAP on the compartment stack
    pub allow_stack_store_local_capability: bool,
    /// Keep MUTABLE_LOAD on the compartment stack
    pub allow_stack_mutable_load: bool,
}

impl CompartmentFlags {
    /// Every privilege granted.
    pub const fn permissive() -> Self {
        Self {
            allow_privileged_register_access: true,
            allow_stack_store_local_capability: true,
            allow_stack_mutable_load: true,
        }
    }
}
