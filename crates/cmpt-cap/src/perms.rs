//! Capability permission bits
//!
//! The permission set follows the Morello architectural permissions. Each
//! capability carries a subset of these bits and every derivation can only
//! ever remove bits, never add them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Architectural permissions carried by a [`Capability`](crate::Capability).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Perms: u32 {
        /// Capability may be stored through non-local authorities
        const GLOBAL          = 1 << 0;
        /// Load data
        const LOAD            = 1 << 1;
        /// Load capabilities with their tag preserved
        const LOAD_CAP        = 1 << 2;
        /// Loaded capabilities keep their store permissions
        const MUTABLE_LOAD    = 1 << 3;
        /// Store data
        const STORE           = 1 << 4;
        /// Store capabilities
        const STORE_CAP       = 1 << 5;
        /// Store capabilities lacking GLOBAL
        const STORE_LOCAL_CAP = 1 << 6;
        /// Fetch instructions
        const EXECUTE         = 1 << 7;
        /// Executive mode (restricted vs executive banked registers)
        const EXECUTIVE       = 1 << 8;
        /// Access to privileged system registers while installed in PCC
        const SYS_REG         = 1 << 9;
        /// Seal other capabilities with the object type given by the address
        const SEAL            = 1 << 10;
        /// Unseal capabilities whose object type equals the address
        const UNSEAL          = 1 << 11;
        /// Participate in a branch-to-sealed-pair
        const CAP_INVOKE      = 1 << 12;
        /// Compartment identity
        const CMPT_ID         = 1 << 13;
        /// Virtual memory management
        const VMEM            = 1 << 14;
        /// Software-defined
        const USER1           = 1 << 15;
        /// Software-defined
        const USER2           = 1 << 16;
        /// Software-defined
        const USER3           = 1 << 17;

        /// Everything needed to read data and capabilities
        const READ_CAP  = Self::LOAD.bits() | Self::LOAD_CAP.bits() | Self::MUTABLE_LOAD.bits();
        /// Everything needed to write data and capabilities
        const WRITE_CAP = Self::STORE.bits() | Self::STORE_CAP.bits() | Self::STORE_LOCAL_CAP.bits();
        /// Everything needed to execute
        const EXEC_CAP  = Self::EXECUTE.bits() | Self::EXECUTIVE.bits() | Self::SYS_REG.bits();

        /// Global read/write memory
        const RW  = Self::GLOBAL.bits() | Self::READ_CAP.bits() | Self::WRITE_CAP.bits();
        /// Global readable code
        const RX  = Self::GLOBAL.bits() | Self::READ_CAP.bits() | Self::EXEC_CAP.bits();
        /// Read/write memory usable as the data half of a sealed pair
        const RWI = Self::RW.bits() | Self::CAP_INVOKE.bits();
        /// Code usable as the code half of a sealed pair
        const RXI = Self::RX.bits() | Self::CAP_INVOKE.bits();
    }
}

impl Perms {
    /// Single permissions in display order, paired with their mnemonic.
    pub const MNEMONICS: [(Perms, char); 18] = [
        (Perms::GLOBAL, 'G'),
        (Perms::LOAD, 'r'),
        (Perms::LOAD_CAP, 'R'),
        (Perms::MUTABLE_LOAD, 'M'),
        (Perms::STORE, 'w'),
        (Perms::STORE_CAP, 'W'),
        (Perms::STORE_LOCAL_CAP, 'L'),
        (Perms::EXECUTE, 'x'),
        (Perms::EXECUTIVE, 'E'),
        (Perms::SYS_REG, 'S'),
        (Perms::SEAL, 's'),
        (Perms::UNSEAL, 'u'),
        (Perms::CAP_INVOKE, 'I'),
        (Perms::CMPT_ID, 'C'),
        (Perms::VMEM, 'V'),
        (Perms::USER1, '1'),
        (Perms::USER2, '2'),
        (Perms::USER3, '3'),
    ];

    /// Permissions removed from a capability loaded through an authority
    /// lacking MUTABLE_LOAD.
    pub const fn mutable_load_strip() -> Perms {
        Perms::WRITE_CAP.union(Perms::MUTABLE_LOAD)
    }
}
