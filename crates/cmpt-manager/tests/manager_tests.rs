//! Compartment manager integration tests
//!
//! Drive the manager end to end on a fresh machine: creation, invocation
//! through real trampolines, isolation properties, teardown and the audit
//! trail.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cmpt_cap::RootAuthority;
use cmpt_machine::{c, check_all_invariants, Insn, Prot, RegisterFile, StepEvent, SysReg, HOST_CALL_SITE};
use cmpt_manager::trampoline::FRAME;
use cmpt_manager::{
    Capability, CmptError, CompartmentFlags, CompartmentHandle, CompartmentManager, Fault, HalError,
    MachineConfig, ManagerConfig, MapError, Mutation, ObjectType, Perms, SealingScheme, HAL,
};

// ============================================================================
// Mock HAL for Testing
// ============================================================================

pub struct MockHal {
    time: AtomicU64,
    debug_log: RefCell<Vec<String>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            debug_log: RefCell::new(Vec::new()),
        }
    }

    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log.borrow().iter().any(|l| l.contains(substr))
    }
}

unsafe impl Send for MockHal {}
unsafe impl Sync for MockHal {}

impl HAL for MockHal {
    fn now_nanos(&self) -> u64 {
        // Every read moves the clock so audit timestamps are distinct.
        self.time.fetch_add(1_000, Ordering::SeqCst)
    }

    fn random_bytes(&self, _buf: &mut [u8]) -> Result<(), HalError> {
        Err(HalError::NotSupported)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(msg.to_string());
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn manager_with(scheme: SealingScheme, machine: MachineConfig) -> CompartmentManager<MockHal> {
    let mut m = CompartmentManager::new(MockHal::new(), machine, ManagerConfig { scheme }).unwrap();
    m.init(1).unwrap();
    m
}

fn manager(scheme: SealingScheme) -> CompartmentManager<MockHal> {
    manager_with(scheme, MachineConfig::default())
}

fn doubler(m: &mut CompartmentManager<MockHal>) -> Capability {
    m.register_function(|frame| {
        let x = frame.arg().address();
        frame.set_result(Capability::from_int(x * 2));
        Ok(())
    })
    .unwrap()
}

fn create(m: &mut CompartmentManager<MockHal>, target: Capability) -> CompartmentHandle {
    m.create_compartment(target, 1, &CompartmentFlags::default()).unwrap()
}

fn quiet(_: &StepEvent, _: &RegisterFile) -> Result<(), Fault> {
    Ok(())
}

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_round_trip_both_schemes_and_stack_sizes() {
    for scheme in [SealingScheme::Lpb, SealingScheme::Lb] {
        for pages in [1, 2, 8] {
            let mut m = manager(scheme);
            let f = doubler(&mut m);
            let handle = m.create_compartment(f, pages, &CompartmentFlags::default()).unwrap();
            for x in [0u64, 1, 21, 0xffff_ffff] {
                assert_eq!(m.invoke_value(&handle, x), Ok(x * 2), "{:?} {} pages", scheme, pages);
            }
        }
    }
}

#[test]
fn test_add_two_numbers_through_buffer() {
    let mut m = manager(SealingScheme::Lpb);
    let add = m
        .register_function(|frame| {
            let args = frame.arg();
            let x = frame.load_u32(&args, args.address())?;
            let y = frame.load_u32(&args, args.address() + 4)?;
            frame.set_result(Capability::from_int((x + y) as u64));
            Ok(())
        })
        .unwrap();
    let handle = create(&mut m, add);

    let buf = m.machine_mut().mmap(4096, Prot::RW, Prot::empty()).unwrap();
    m.machine_mut()
        .store_bytes(&buf, buf.base(), &[2, 0, 0, 0, 3, 0, 0, 0])
        .unwrap();
    let args = buf.bounds_set_exact(8).perms_and(Perms::GLOBAL | Perms::LOAD);
    let result = m.invoke(&handle, args).unwrap();
    assert_eq!(result.address(), 5);
}

#[test]
fn test_repeated_invocations_reuse_the_stack() {
    let mut m = manager(SealingScheme::Lb);
    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    let f = m
        .register_function(move |frame| {
            seen.fetch_add(1, Ordering::SeqCst);
            let sp = frame.csp();
            frame.set_result(Capability::from_int(sp.address()));
            Ok(())
        })
        .unwrap();
    let handle = create(&mut m, f);
    let first = m.invoke_value(&handle, 0).unwrap();
    for _ in 0..50 {
        assert_eq!(m.invoke_value(&handle, 0), Ok(first));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 51);
}

// ============================================================================
// Preconditions and resources
// ============================================================================

#[test]
fn test_reject_uninitialized_manager() {
    let mut m =
        CompartmentManager::new(MockHal::new(), MachineConfig::default(), ManagerConfig::default()).unwrap();
    let f = doubler(&mut m);
    assert_eq!(
        m.create_compartment(f, 1, &CompartmentFlags::default()),
        Err(CmptError::NotInitialized)
    );
    assert_eq!(m.machine().memory().mapped_pages(), 4);
}

#[test]
fn test_missing_platform_root_stays_uninitialized() {
    let config = MachineConfig {
        expose_seal_root: false,
        ..MachineConfig::default()
    };
    let mut m = CompartmentManager::new(MockHal::new(), config, ManagerConfig::default()).unwrap();
    assert_eq!(m.init(1), Ok(()));
    assert!(!m.is_initialized());
    assert!(m.hal().has_log_containing("no seal root"));
    let f = doubler(&mut m);
    assert_eq!(
        m.create_compartment(f, 1, &CompartmentFlags::default()),
        Err(CmptError::NotInitialized)
    );
}

#[test]
fn test_invalid_arguments() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    assert_eq!(
        m.create_compartment(f, 0, &CompartmentFlags::default()),
        Err(CmptError::InvalidStackPages { requested: 0 })
    );
    assert_eq!(
        m.create_compartment(Capability::from_int(f.address()), 1, &CompartmentFlags::default()),
        Err(CmptError::InvalidTarget)
    );
    assert!(m.compartments().is_empty());
}

#[test]
fn test_resource_exhaustion_releases_partial_allocations() {
    // Host stack (4) + code (1) + data (1) + one stack page.
    let config = MachineConfig {
        memory_pages: 7,
        ..MachineConfig::default()
    };
    let mut m = manager_with(SealingScheme::Lpb, config);
    let f = doubler(&mut m);

    assert_eq!(
        m.create_compartment(f, 2, &CompartmentFlags::default()),
        Err(CmptError::ResourceExhausted(MapError::OutOfMemory))
    );
    assert_eq!(m.machine().memory().mapped_pages(), 4);
    assert!(m.compartments().is_empty());

    let handle = m.create_compartment(f, 1, &CompartmentFlags::default()).unwrap();
    assert_eq!(m.invoke_value(&handle, 4), Ok(8));
    assert_eq!(
        m.create_compartment(f, 1, &CompartmentFlags::default()),
        Err(CmptError::ResourceExhausted(MapError::OutOfMemory))
    );
    assert_eq!(m.compartments().len(), 1);
}

#[test]
fn test_w_xor_x_holds_for_every_mapping() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let handles: Vec<_> = (0..4).map(|_| create(&mut m, f)).collect();
    for h in &handles {
        m.invoke_value(h, 1).unwrap();
    }
    assert!(check_all_invariants(m.machine()).is_empty());
    for info in m.compartments() {
        assert_eq!(m.machine().memory().prot_at(info.code.base), Some(Prot::RX));
        assert_eq!(m.machine().memory().prot_at(info.data.base), Some(Prot::RW));
        assert_eq!(m.machine().memory().prot_at(info.stack.base), Some(Prot::RW));
    }
}

// ============================================================================
// Identities and gates
// ============================================================================

#[test]
fn test_identities_are_monotonic_and_distinct() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let handles: Vec<_> = (0..3).map(|_| create(&mut m, f)).collect();
    let ids: Vec<u64> = handles.iter().map(|h| m.identity_of(h).unwrap()).collect();
    // Seed 1 is below the first user object type.
    assert_eq!(ids, vec![4, 5, 6]);
    assert_eq!(m.next_identity(), 7);

    let otypes: Vec<u16> = m.compartments().iter().map(|c| c.otype).collect();
    assert_eq!(otypes, vec![4, 5, 6]);
}

#[test]
fn test_gates_are_sealed_with_the_identity() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let handle = create(&mut m, f);
    let id = m.identity_of(&handle).unwrap();
    let gates = m.gates(&handle).unwrap();

    assert!(gates.identity.is_sentry());
    assert!(gates.identity.check_perms(Perms::CMPT_ID));
    assert_eq!(gates.identity.address(), id);
    assert!(gates.target.is_sentry());
    for gate in [gates.entry, gates.data, gates.exit] {
        assert!(gate.is_valid());
        assert_eq!(gate.otype(), ObjectType(id as u16));
    }
    assert!(gates.entry.check_perms(Perms::EXECUTE | Perms::CAP_INVOKE));
    assert!(!gates.data.check_perms(Perms::EXECUTE));
    assert_eq!(gates.data.length(), 32);
}

#[test]
fn test_handle_encoding_follows_scheme() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let lpb = create(&mut m, f);
    assert_eq!(lpb.capability().otype(), ObjectType::LPB);

    let mut m = manager(SealingScheme::Lb);
    let f = doubler(&mut m);
    let lb = create(&mut m, f);
    assert_eq!(lb.capability().otype(), ObjectType::LB);
    assert!(!lb.capability().check_perms(Perms::STORE));
}

#[test]
fn test_isolation_across_identities() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let a = create(&mut m, f);
    let b = create(&mut m, f);
    let ga = m.gates(&a).unwrap();
    let gb = m.gates(&b).unwrap();
    assert_ne!(ga.entry.otype(), gb.data.otype());

    // Pairing A's entry with B's runtime record is refused by the hardware.
    let regs = m.machine_mut().regs_mut();
    regs.set(c(27), ga.entry);
    regs.set(c(28), gb.data);
    let err = m
        .machine_mut()
        .call(Insn::Brs { rn: c(27), rm: c(28) }, &mut quiet)
        .unwrap_err();
    assert_eq!(err, Fault::SealedPairMismatch { addr: HOST_CALL_SITE });

    // Fatal: the manager is done.
    assert_eq!(m.invoke_value(&a, 1), Err(CmptError::Fault(err)));
    assert_eq!(
        m.create_compartment(f, 1, &CompartmentFlags::default()),
        Err(CmptError::Fault(err))
    );
}

#[test]
fn test_sealed_gate_cannot_be_branched_to_directly() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let a = create(&mut m, f);
    let entry = m.gates(&a).unwrap().entry;
    m.machine_mut().regs_mut().set(c(1), entry);
    let err = m
        .machine_mut()
        .call(Insn::Blr { rn: c(1) }, &mut quiet)
        .unwrap_err();
    assert!(matches!(err, Fault::SealViolation { .. }));
}

#[test]
fn test_identity_overflow_is_fatal() {
    let mut m =
        CompartmentManager::new(MockHal::new(), MachineConfig::default(), ManagerConfig::default()).unwrap();
    m.init(0x7fff).unwrap();
    let f = doubler(&mut m);
    let last = create(&mut m, f);
    assert_eq!(m.identity_of(&last), Some(0x7fff));

    let err = m.create_compartment(f, 1, &CompartmentFlags::default()).unwrap_err();
    assert_eq!(err, CmptError::Fault(Fault::ObjectTypeOverflow { value: 0x8000 }));
    assert!(err.is_fatal());
    // The failed attempt left nothing mapped behind.
    assert_eq!(m.compartments().len(), 1);
    assert_eq!(m.machine().memory().mapped_pages(), 4 + 3);
}

// ============================================================================
// Call protocol
// ============================================================================

#[derive(Default, Debug, Clone)]
struct Observed {
    cid: Option<Capability>,
    csp: Option<Capability>,
    leaked: Vec<u8>,
}

#[test]
fn test_target_runs_under_its_identity_on_its_stack() {
    let mut m = manager(SealingScheme::Lpb);
    let observed = Arc::new(Mutex::new(Observed::default()));
    let sink = observed.clone();
    let f = m
        .register_function(move |frame| {
            let cid = frame.read_sysreg(SysReg::CidEl0)?;
            let mut o = sink.lock().unwrap();
            o.cid = Some(cid);
            o.csp = Some(frame.csp());
            Ok(())
        })
        .unwrap();
    let handle = create(&mut m, f);
    let caller_csp = m.machine().regs().csp();
    m.invoke_value(&handle, 0).unwrap();

    let o = observed.lock().unwrap().clone();
    let info = m.compartments()[0].clone();
    let cid = o.cid.unwrap();
    assert_eq!(cid.address(), info.id);
    assert!(cid.is_sentry());
    let csp = o.csp.unwrap();
    assert_eq!(csp.base(), info.stack.base);
    assert_eq!(csp.limit(), info.stack.base + info.stack.len);
    assert_eq!(csp.address(), csp.limit());

    // Back home: caller identity and stack.
    assert_eq!(m.machine().regs().cid(), Capability::NULL);
    assert_eq!(m.machine().regs().csp(), caller_csp);
}

#[test]
fn test_stack_privacy() {
    let mut m = manager(SealingScheme::Lpb);
    let a_stack = Arc::new(Mutex::new(None::<Capability>));
    let sink = a_stack.clone();
    let fa = m
        .register_function(move |frame| {
            *sink.lock().unwrap() = Some(frame.csp());
            Ok(())
        })
        .unwrap();
    // B is handed A's stack address and tries to read it.
    let fb = m
        .register_function(|frame| {
            let addr = frame.arg().address();
            let own = frame.csp();
            let through_arg = frame.load_u64(&frame.arg(), addr).is_err();
            let through_own = frame.load_u64(&own, addr).is_err();
            frame.set_result(Capability::from_int((through_arg && through_own) as u64));
            Ok(())
        })
        .unwrap();
    let a = create(&mut m, fa);
    let b = create(&mut m, fb);

    m.invoke_value(&a, 0).unwrap();
    let a_sp = a_stack.lock().unwrap().unwrap();
    assert_eq!(m.invoke_value(&b, a_sp.address() - 16), Ok(1));
    assert!(!m.machine().regs().csp().covers(a_sp.base(), 16));
}

#[test]
fn test_caller_registers_do_not_reach_target() {
    for scheme in [SealingScheme::Lpb, SealingScheme::Lb] {
        let mut m = manager(scheme);
        let observed = Arc::new(Mutex::new(Observed::default()));
        let sink = observed.clone();
        let f = m
            .register_function(move |frame| {
                let leaked = (1..=28).filter(|&n| frame.reg(c(n)) != Capability::NULL).collect();
                sink.lock().unwrap().leaked = leaked;
                Ok(())
            })
            .unwrap();
        let handle = create(&mut m, f);
        let regs = m.machine_mut().regs_mut();
        for n in 1..=28 {
            regs.set(c(n), Capability::from_int(0xdead_0000 + n as u64));
        }
        m.invoke_value(&handle, 7).unwrap();
        assert!(observed.lock().unwrap().leaked.is_empty(), "{:?}", scheme);
    }
}

#[test]
fn test_target_registers_do_not_reach_caller() {
    let mut m = manager(SealingScheme::Lpb);
    let f = m
        .register_function(|frame| {
            for n in 1..=18 {
                frame.set_reg(c(n), Capability::from_int(0xbeef_0000 + n as u64));
            }
            frame.set_result(Capability::from_int(1));
            Ok(())
        })
        .unwrap();
    let handle = create(&mut m, f);
    assert_eq!(m.invoke_value(&handle, 0), Ok(1));
    let regs = m.machine().regs();
    assert_eq!(regs.non_null_in(1..=18).count(), 0);
}

#[test]
fn test_callee_saved_registers_preserved() {
    for scheme in [SealingScheme::Lpb, SealingScheme::Lb] {
        let mut m = manager(scheme);
        let f = m
            .register_function(|frame| {
                for n in 19..=29 {
                    frame.set_reg(c(n), Capability::from_int(0xbad));
                }
                Ok(())
            })
            .unwrap();
        let handle = create(&mut m, f);
        let buf = m.machine_mut().mmap(4096, Prot::RW, Prot::empty()).unwrap();
        let regs = m.machine_mut().regs_mut();
        for n in 19..=28 {
            regs.set(c(n), Capability::from_int(0x1900 + n as u64));
        }
        // A tagged c29 must come back as the same capability.
        regs.set(c(29), buf);
        m.invoke_value(&handle, 0).unwrap();
        let regs = m.machine().regs();
        for n in 19..=28 {
            assert_eq!(regs.get(c(n)), Capability::from_int(0x1900 + n as u64), "{:?} c{}", scheme, n);
        }
        assert_eq!(regs.get(c(29)), buf, "{:?}", scheme);
    }
}

#[test]
fn test_host_stack_untouched_below_the_call_frame() {
    const SENTINEL: u8 = 0x5a;
    for scheme in [SealingScheme::Lpb, SealingScheme::Lb] {
        let mut m = manager(scheme);
        let f = m
            .register_function(|frame| {
                let sp = frame.csp();
                let mut written = 0u64;
                let mut addr = sp.base();
                while addr < sp.address() {
                    frame.store_u64(&sp, addr, 0xa5a5_a5a5_a5a5_a5a5)?;
                    addr += 8;
                    written += 8;
                }
                frame.set_result(Capability::from_int(written));
                Ok(())
            })
            .unwrap();
        let handle = create(&mut m, f);

        let host = m.machine().regs().csp();
        let below = host.address() - FRAME as u64 - host.base();
        let fill = vec![SENTINEL; below as usize];
        m.machine_mut().store_bytes(&host, host.base(), &fill).unwrap();

        assert_eq!(m.invoke_value(&handle, 0), Ok(4096), "{:?}", scheme);

        assert_eq!(m.machine().regs().csp(), host);
        let mut after = vec![0u8; below as usize];
        m.machine_mut().load_bytes(&host, host.base(), &mut after).unwrap();
        assert!(after.iter().all(|&b| b == SENTINEL), "{:?}", scheme);
    }
}

// ============================================================================
// Privileges
// ============================================================================

fn sysreg_reader(m: &mut CompartmentManager<MockHal>) -> Capability {
    m.register_function(|frame| {
        let cctlr = frame.read_sysreg(SysReg::CctlrEl0)?;
        frame.set_result(Capability::from_int(cctlr.address() + 1));
        Ok(())
    })
    .unwrap()
}

#[test]
fn test_privileged_register_access_stripped_by_default() {
    let mut m = manager(SealingScheme::Lpb);
    let f = sysreg_reader(&mut m);
    let handle = create(&mut m, f);
    assert!(!m.gates(&handle).unwrap().target.check_perms(Perms::SYS_REG));

    let err = m.invoke_value(&handle, 0).unwrap_err();
    assert!(matches!(err, CmptError::Fault(Fault::SystemRegister { addr }) if addr == f.address()));
    assert!(err.is_fatal());
}

#[test]
fn test_privileged_register_access_when_allowed() {
    let mut m = manager(SealingScheme::Lpb);
    let f = sysreg_reader(&mut m);
    let flags = CompartmentFlags {
        allow_privileged_register_access: true,
        ..CompartmentFlags::default()
    };
    let handle = m.create_compartment(f, 1, &flags).unwrap();
    assert_eq!(m.invoke_value(&handle, 0), Ok(1));
}

/// (local store refused, loaded capability writable)
fn stack_flag_reporter(m: &mut CompartmentManager<MockHal>) -> Capability {
    m.register_function(|frame| {
        let sp = frame.csp();
        let local = sp.perms_clear(Perms::GLOBAL);
        let refused = frame.store_cap(&sp, sp.address() - 16, local).is_err();
        frame.store_cap(&sp, sp.address() - 32, sp)?;
        let loaded = frame.load_cap(&sp, sp.address() - 32)?;
        let writable = loaded.check_perms(Perms::STORE);
        frame.set_result(Capability::from_int(((refused as u64) << 1) | writable as u64));
        Ok(())
    })
    .unwrap()
}

#[test]
fn test_stack_flags_strip_local_stores_and_mutable_loads() {
    let mut m = manager(SealingScheme::Lpb);
    let f = stack_flag_reporter(&mut m);
    let strict = m.create_compartment(f, 1, &CompartmentFlags::default()).unwrap();
    let permissive = m.create_compartment(f, 1, &CompartmentFlags::permissive()).unwrap();

    assert_eq!(m.invoke_value(&strict, 0), Ok(0b10));
    assert_eq!(m.invoke_value(&permissive, 0), Ok(0b01));
}

#[test]
fn test_target_cannot_claim_root_authority() {
    let mut m = manager(SealingScheme::Lpb);
    let host = m.machine().regs().csp();
    let f = m
        .register_function(move |frame| {
            let claimed = RootAuthority::claim().is_some();
            let host_readable = frame.load_u64(&frame.csp(), host.base()).is_ok();
            frame.set_result(Capability::from_int(((claimed as u64) << 1) | host_readable as u64));
            Ok(())
        })
        .unwrap();
    let handle = create(&mut m, f);
    assert_eq!(m.invoke_value(&handle, 0), Ok(0));
    assert!(RootAuthority::claim().is_none());
}

#[test]
fn test_strip_permission_and_reseal() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    assert!(f.check_perms(Perms::SYS_REG));

    let weak = m.strip_permission_and_reseal(f, Perms::SYS_REG).unwrap();
    assert!(weak.is_sentry());
    assert!(!weak.check_perms(Perms::SYS_REG));
    assert_eq!(weak.address(), f.address());

    let foreign = m.machine_mut().mmap(0x1000, Prot::RX, Prot::RX).unwrap().sentry();
    assert_eq!(
        m.strip_permission_and_reseal(foreign, Perms::SYS_REG),
        Err(CmptError::InvalidTarget)
    );
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_destroy_unmaps_and_invoke_after_destroy_faults() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let keep = create(&mut m, f);
    let gone = create(&mut m, f);
    let info = m
        .compartments()
        .into_iter()
        .find(|c| c.handle == gone.address())
        .unwrap();

    m.destroy_compartment(&gone).unwrap();
    assert!(!m.machine().memory().is_mapped(info.code.base, info.code.len));
    assert!(!m.machine().memory().is_mapped(info.data.base, info.data.len));
    assert!(!m.machine().memory().is_mapped(info.stack.base, info.stack.len));
    assert_eq!(m.identity_of(&gone), None);
    assert_eq!(
        m.destroy_compartment(&gone),
        Err(CmptError::UnknownCompartment { handle: gone.address() })
    );

    // Other compartments are untouched.
    assert_eq!(m.invoke_value(&keep, 3), Ok(6));

    // A new compartment never lands on the old addresses.
    let fresh = create(&mut m, f);
    assert!(fresh.address() > gone.address());

    assert_eq!(
        m.invoke_value(&gone, 3),
        Err(CmptError::Fault(Fault::StaleHandle { addr: gone.address() }))
    );
}

#[test]
fn test_target_fault_halts_the_manager() {
    let mut m = manager(SealingScheme::Lpb);
    let f = m
        .register_function(|frame| {
            let bogus = Capability::from_int(0x4000_0000);
            frame.load_u64(&bogus, bogus.address()).map(|_| ())
        })
        .unwrap();
    let handle = create(&mut m, f);
    let err = m.invoke_value(&handle, 0).unwrap_err();
    assert_eq!(err, CmptError::Fault(Fault::TagViolation { addr: 0x4000_0000 }));
    assert_eq!(m.destroy_compartment(&handle), Err(err));
    assert_eq!(m.init(9), Err(err));
    assert!(m.hal().has_log_containing("[cmpt-manager] FATAL: tag violation"));
}

// ============================================================================
// Audit trail
// ============================================================================

#[test]
fn test_ledger_replay_matches_live_compartments() {
    let mut m = manager(SealingScheme::Lb);
    let f = doubler(&mut m);
    let a = create(&mut m, f);
    let b = create(&mut m, f);
    let _ = create(&mut m, f);
    m.destroy_compartment(&b).unwrap();
    m.invoke_value(&a, 1).unwrap();

    let live = m.audit.ledger().live_compartments();
    let handles: Vec<u64> = m.compartments().iter().map(|c| c.handle).collect();
    assert_eq!(live.keys().copied().collect::<Vec<_>>(), handles);
    assert!(!m.audit.ledger().halted());

    let json = serde_json::to_string(&m.audit.snapshot()).unwrap();
    assert!(json.contains("CompartmentDestroyed"));
    assert!(json.contains("\"Invoke\""));
}

#[test]
fn test_audit_records_fatal_invoke() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let handle = create(&mut m, f);
    m.destroy_compartment(&handle).unwrap();
    let _ = m.invoke_value(&handle, 1);

    let last = m.audit.ledger().entries().last().unwrap();
    assert!(matches!(&last.mutation, Mutation::Halted { fault } if fault.contains("stale")));
    assert!(m.audit.ledger().halted());
}

#[test]
fn test_debug_log_names_compartments() {
    let mut m = manager(SealingScheme::Lpb);
    let f = doubler(&mut m);
    let handle = create(&mut m, f);
    let rendered = handle.capability().to_string();
    assert!(rendered.contains(" lpb "));
    m.destroy_compartment(&handle).unwrap();
    assert!(m.hal().has_log_containing("[cmpt-manager] create: compartment 4 otype 0x0004"));
    assert!(m.hal().has_log_containing(&format!("pages handle {}", rendered)));
    assert!(m.hal().has_log_containing(&format!("[cmpt-manager] destroy: compartment 4 handle {}", rendered)));
}

