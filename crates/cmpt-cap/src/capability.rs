//! The capability value type
//!
//! A [`Capability`] is an unforgeable reference: an address together with the
//! bounds it may access, the permissions it grants, a validity tag, and an
//! optional seal. Every operation here returns a new value and follows the
//! hardware rules:
//!
//! 1. **Monotonic**: bounds only shrink and permissions only drop
//! 2. **Sealed is frozen**: modifying a sealed capability clears its tag
//! 3. **Fail closed**: an invalid request yields an untagged result, never a
//!    capability with more authority than its inputs

use core::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::perms::Perms;

/// Size in bytes of a capability in memory (and the tag granule).
pub const CAP_SIZE: u64 = 16;

/// Object types fit in 15 bits.
pub const OTYPE_MASK: u64 = 0x7fff;

/// Object type of a capability. Zero means unsealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectType(pub u16);

impl ObjectType {
    /// Not sealed
    pub const UNSEALED: ObjectType = ObjectType(0);
    /// Sealed entry ("sentry"): unsealed by a branch to it
    pub const RB: ObjectType = ObjectType(1);
    /// Load-pair-and-branch: unsealed by `ldpblr`
    pub const LPB: ObjectType = ObjectType(2);
    /// Load-and-branch: unsealed by `blr [cn, #imm]`
    pub const LB: ObjectType = ObjectType(3);
    /// First object type available to software sealing
    pub const FIRST_USER: u64 = 4;

    /// True for the three architecturally reserved sealed types.
    pub fn is_reserved(self) -> bool {
        matches!(self, ObjectType::RB | ObjectType::LPB | ObjectType::LB)
    }
}

/// An architectural capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Capability {
    address: u64,
    base: u64,
    length: u64,
    perms: Perms,
    otype: ObjectType,
    tag: bool,
}

/// The right to mint root capabilities.
///
/// There is one per process. The platform claims it when it first comes up;
/// every later [`claim`](RootAuthority::claim) gets `None`, so code running on
/// the platform can only derive capabilities from the ones it is handed.
#[derive(Debug)]
pub struct RootAuthority {
    _private: (),
}

static ROOT_AUTHORITY_CLAIMED: AtomicBool = AtomicBool::new(false);

impl RootAuthority {
    /// Take the process's root authority. `None` once it has been taken.
    pub fn claim() -> Option<RootAuthority> {
        if ROOT_AUTHORITY_CLAIMED.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(RootAuthority { _private: () })
        }
    }

    /// Mint a tagged, unsealed root covering `[base, base + length)`.
    pub fn new_root(&self, base: u64, length: u64, perms: Perms) -> Capability {
        Capability::new_root(base, length, perms)
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::NULL
    }
}

impl Capability {
    /// The null capability: untagged, no bounds, no permissions.
    pub const NULL: Capability = Capability::from_int(0);

    /// An integer held in a capability register (untagged).
    pub const fn from_int(value: u64) -> Self {
        Self {
            address: value,
            base: 0,
            length: 0,
            perms: Perms::empty(),
            otype: ObjectType::UNSEALED,
            tag: false,
        }
    }

    /// Mint a root capability covering `[base, base + length)`.
    ///
    /// Outside this crate roots come only from a [`RootAuthority`].
    pub(crate) fn new_root(base: u64, length: u64, perms: Perms) -> Self {
        Self {
            address: base,
            base,
            length,
            perms,
            otype: ObjectType::UNSEALED,
            tag: true,
        }
    }

    // ========================================================================
    // Field access (always permitted, sealed or not)
    // ========================================================================

    /// Current address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Lower bound.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the bounds.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Length, reported as zero for an untagged null pointer.
    pub fn length_or_zero(&self) -> u64 {
        if !self.tag && self.address == 0 {
            0
        } else {
            self.length
        }
    }

    /// Upper bound (exclusive).
    pub fn limit(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Address relative to base.
    pub fn offset(&self) -> i64 {
        self.address.wrapping_sub(self.base) as i64
    }

    /// Permission set.
    pub fn perms(&self) -> Perms {
        self.perms
    }

    /// Object type (zero when unsealed).
    pub fn otype(&self) -> ObjectType {
        self.otype
    }

    /// Validity tag.
    pub fn is_valid(&self) -> bool {
        self.tag
    }

    /// True if the capability carries any seal.
    pub fn is_sealed(&self) -> bool {
        self.otype != ObjectType::UNSEALED
    }

    /// True if the capability is a sealed entry.
    pub fn is_sentry(&self) -> bool {
        self.otype == ObjectType::RB
    }

    /// True if every permission in `mask` is present.
    pub fn check_perms(&self, mask: Perms) -> bool {
        self.perms.contains(mask)
    }

    /// True if the address lies within the bounds.
    pub fn in_bounds(&self) -> bool {
        self.base <= self.address && self.address < self.limit()
    }

    /// Bytes between the address and the limit, or zero when out of bounds.
    pub fn tail(&self) -> u64 {
        if self.in_bounds() {
            self.limit() - self.address
        } else {
            0
        }
    }

    /// True if the capability could be dereferenced at its address.
    pub fn is_deref(&self) -> bool {
        self.tag && self.in_bounds() && !self.is_sealed()
    }

    /// True if the capability lacks GLOBAL.
    pub fn is_local(&self) -> bool {
        !self.check_perms(Perms::GLOBAL)
    }

    /// True if `[addr, addr + len)` lies inside the bounds.
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.limit(),
            None => false,
        }
    }

    // ========================================================================
    // Derivation
    // ========================================================================

    /// Copy with the tag cleared.
    pub fn tag_cleared(&self) -> Self {
        Self { tag: false, ..*self }
    }

    fn mutate(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut out = *self;
        f(&mut out);
        if self.is_sealed() {
            out.tag = false;
        }
        out
    }

    /// Set the address.
    pub fn with_address(&self, address: u64) -> Self {
        self.mutate(|c| c.address = address)
    }

    /// Set the address relative to base.
    pub fn with_offset(&self, offset: i64) -> Self {
        self.with_address(self.base.wrapping_add(offset as u64))
    }

    /// Move the address by `delta` bytes.
    pub fn add(&self, delta: i64) -> Self {
        self.with_address(self.address.wrapping_add(delta as u64))
    }

    /// Round the address up to a multiple of `align` (a power of two).
    pub fn align_up(&self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        let mask = align - 1;
        self.with_address(self.address.wrapping_add(mask) & !mask)
    }

    /// Round the address down to a multiple of `align` (a power of two).
    pub fn align_down(&self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        self.with_address(self.address & !(align - 1))
    }

    fn narrow(&self, base: u64, limit: u64) -> Self {
        let fits = limit >= base && base >= self.base && limit <= self.limit();
        let mut out = self.mutate(|c| {
            c.base = base;
            c.length = limit.wrapping_sub(base);
        });
        if !fits {
            out.tag = false;
        }
        out
    }

    /// Narrow the bounds to `[address, address + length)`, rounding the limit
    /// up to the capability granule when the parent bounds allow it.
    pub fn bounds_set(&self, length: u64) -> Self {
        let base = self.address;
        let exact = base.saturating_add(length);
        let rounded = exact.saturating_add(CAP_SIZE - 1) & !(CAP_SIZE - 1);
        if rounded <= self.limit() {
            self.narrow(base, rounded)
        } else {
            self.narrow(base, exact)
        }
    }

    /// Narrow the bounds to exactly `[address, address + length)`.
    pub fn bounds_set_exact(&self, length: u64) -> Self {
        self.narrow(self.address, self.address.saturating_add(length))
    }

    /// Keep only the permissions in `mask`.
    pub fn perms_and(&self, mask: Perms) -> Self {
        self.mutate(|c| c.perms &= mask)
    }

    /// Remove the permissions in `mask`.
    pub fn perms_clear(&self, mask: Perms) -> Self {
        self.mutate(|c| c.perms -= mask)
    }

    // ========================================================================
    // Sealing
    // ========================================================================

    fn seal_as(&self, otype: ObjectType) -> Self {
        let ok = self.tag && !self.is_sealed();
        Self {
            otype,
            tag: ok,
            ..*self
        }
    }

    /// Seal with the object type given by `key`'s address.
    ///
    /// `key` must be tagged, unsealed, in bounds, carry SEAL, and address a
    /// software object type. Otherwise the result is untagged.
    pub fn seal(&self, key: &Capability) -> Self {
        let key_ok = key.tag
            && !key.is_sealed()
            && key.check_perms(Perms::SEAL)
            && key.in_bounds()
            && key.address >= ObjectType::FIRST_USER
            && key.address <= OTYPE_MASK;
        let out = self.seal_as(ObjectType(key.address as u16));
        if key_ok {
            out
        } else {
            out.tag_cleared()
        }
    }

    /// Unseal with `key`, whose address must equal this capability's object
    /// type and which must carry UNSEAL.
    pub fn unseal(&self, key: &Capability) -> Self {
        let ok = self.tag
            && self.is_sealed()
            && key.tag
            && !key.is_sealed()
            && key.check_perms(Perms::UNSEAL)
            && key.in_bounds()
            && key.address == self.otype.0 as u64;
        Self {
            otype: ObjectType::UNSEALED,
            tag: ok,
            ..*self
        }
    }

    /// Seal as a sealed entry (RB).
    pub fn sentry(&self) -> Self {
        self.seal_as(ObjectType::RB)
    }

    /// Seal for load-pair-and-branch (LPB).
    pub fn lpb_sentry(&self) -> Self {
        self.seal_as(ObjectType::LPB)
    }

    /// Seal for load-and-branch (LB).
    pub fn lb_sentry(&self) -> Self {
        self.seal_as(ObjectType::LB)
    }

    /// Rederive `bits` from `key`.
    ///
    /// Succeeds when `key` is a tagged, unsealed capability whose bounds and
    /// permissions include those of `bits`. The object type of `bits` is
    /// preserved. Otherwise the result is untagged.
    pub fn build(key: &Capability, bits: &Capability) -> Self {
        let ok = key.tag
            && !key.is_sealed()
            && bits.base >= key.base
            && bits.limit() <= key.limit()
            && bits.length <= key.length
            && key.perms.contains(bits.perms);
        Self { tag: ok, ..*bits }
    }
}

// ============================================================================
// Kani Proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    fn any_cap() -> Capability {
        let base: u64 = kani::any();
        let length: u64 = kani::any();
        kani::assume(base.checked_add(length).is_some());
        Capability::new_root(base, length, Perms::from_bits_truncate(kani::any()))
    }

    /// Proof: permission derivation never adds bits
    #[kani::proof]
    fn perms_never_widen() {
        let cap = any_cap();
        let mask = Perms::from_bits_truncate(kani::any());
        let derived = cap.perms_and(mask);
        kani::assert(cap.perms().contains(derived.perms()), "perms_and widened");
        let cleared = cap.perms_clear(mask);
        kani::assert(cap.perms().contains(cleared.perms()), "perms_clear widened");
    }

    /// Proof: a tagged bounds result lies within the parent
    #[kani::proof]
    fn bounds_never_widen() {
        let cap = any_cap();
        let len: u64 = kani::any();
        let narrowed = cap.bounds_set_exact(len);
        if narrowed.is_valid() {
            kani::assert(narrowed.base() >= cap.base(), "base moved down");
            kani::assert(narrowed.limit() <= cap.limit(), "limit moved up");
        }
    }

    /// Proof: sealing without SEAL never yields a tagged result
    #[kani::proof]
    fn seal_requires_seal_permission() {
        let cap = any_cap();
        let key = any_cap();
        kani::assume(!key.perms().contains(Perms::SEAL));
        kani::assert(!cap.seal(&key).is_valid(), "sealed without SEAL");
    }
}
