// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork against the emulated kernel
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! TEST_SCOPE:
//!   - Page sharing decisions and fault isolation between parent and child
//!   - Fault handler registration and fatal fault detection
//!   - Child setup (identity, upcall, status) and teardown on failure
//!
//! TEST_SCENARIOS:
//!   - writes_after_fork_are_private(): both sides see only their own writes
//!   - read_only_pages_are_shared_untouched(): parent mapping left as is, child read-only
//!   - exception_stacks_are_private(): each side has its own frame
//!   - scratch_slot_is_released(): no mapping left at the scratch address
//!   - unexpected_faults_are_fatal(): read, missing page table, read-only or writable non-COW page
//!   - child_setup(): identity repair, inherited upcall, runnable status
//!   - failed_setup_destroys_child(): injected failures at every post-spawn step
//!
//! DEPENDENCIES:
//!   - nexus-sim: host kernel emulation

use std::sync::atomic::{AtomicUsize, Ordering};

use nexus_abi::{
    AbiError, EnvStatus, EnvTable, EnvType, FaultCode, PageFlags, Spawned, Syscalls,
    UTrapframe, ENV_SELF, EXCEPTION_STACK, NENV, PAGE_SIZE, PFTEMP, UTEXT,
};
use nexus_fork::{FaultCause, ForkError, Process, Step};
use nexus_sim::{Op, SimEnv, SimFault, SimKernel};

const UPCALL: usize = UTEXT + 0x20;
const DATA: usize = UTEXT;
const RODATA: usize = UTEXT + PAGE_SIZE;

fn boot(kernel: &SimKernel) -> Process<SimEnv> {
    Process::new(kernel.spawn_root(EnvType::User).unwrap(), UPCALL).unwrap()
}

fn no_upcall(_: &UTrapframe) -> bool {
    false
}

fn write(process: &Process<SimEnv>, va: usize, bytes: &[u8]) -> Result<(), SimFault> {
    process.kernel().store(va, bytes, &mut |utf| process.dispatch_fault(utf).is_ok())
}

fn read(process: &Process<SimEnv>, va: usize, len: usize) -> Vec<u8> {
    process.kernel().load(va, len).unwrap()
}

/// Boots a parent with one writable and one read-only page of data.
fn populated(kernel: &SimKernel) -> Process<SimEnv> {
    let parent = boot(kernel);
    let env = parent.kernel();
    env.page_alloc(ENV_SELF, DATA, PageFlags::URW).unwrap();
    env.store(DATA, b"parent", &mut no_upcall).unwrap();
    env.page_alloc(ENV_SELF, RODATA, PageFlags::URW).unwrap();
    env.store(RODATA, b"rodata", &mut no_upcall).unwrap();
    env.page_map(ENV_SELF, RODATA, ENV_SELF, RODATA, PageFlags::UR).unwrap();
    parent
}

/// Forks `parent` and resumes the child's side of the call.
fn fork_pair(kernel: &SimKernel, parent: &mut Process<SimEnv>) -> Process<SimEnv> {
    let Spawned::Parent(id) = parent.fork().unwrap() else {
        panic!("parent must see the child id");
    };
    let mut child = parent.snapshot_with(kernel.env(id));
    assert_eq!(child.fork().unwrap(), Spawned::Child);
    child
}

fn children_of(env: &SimEnv) -> usize {
    (0..NENV).filter_map(|i| env.env_at(i)).filter(|info| info.parent == env.id()).count()
}

#[test]
fn writes_after_fork_are_private() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    let child = fork_pair(&kernel, &mut parent);
    let (p, c) = (parent.this_env(), child.this_env());

    assert_eq!(kernel.pte(p, DATA).flags(), PageFlags::UCOW);
    assert_eq!(kernel.pte(c, DATA).flags(), PageFlags::UCOW);
    assert_eq!(kernel.pte(p, DATA).ppn(), kernel.pte(c, DATA).ppn());

    write(&child, DATA, b"child!").unwrap();
    assert_eq!(read(&child, DATA, 6), b"child!");
    assert_eq!(read(&parent, DATA, 6), b"parent");
    assert_eq!(kernel.pte(c, DATA).flags(), PageFlags::URW);
    assert_ne!(kernel.pte(p, DATA).ppn(), kernel.pte(c, DATA).ppn());

    write(&parent, DATA + 1, b"ARENT").unwrap();
    assert_eq!(read(&parent, DATA, 6), b"pARENT");
    assert_eq!(read(&child, DATA, 6), b"child!");
}

#[test]
fn read_only_pages_are_shared_untouched() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    let before = kernel.pte(parent.this_env(), RODATA);
    let child = fork_pair(&kernel, &mut parent);

    assert_eq!(kernel.pte(parent.this_env(), RODATA), before);
    let shared = kernel.pte(child.this_env(), RODATA);
    assert_eq!(shared.ppn(), before.ppn());
    assert_eq!(shared.flags(), PageFlags::UR);
    assert_eq!(read(&child, RODATA, 6), b"rodata");

    let err = write(&child, RODATA, b"x").unwrap_err();
    assert!(matches!(err, SimFault::HandlerFailed(utf) if utf.fault_va == RODATA));
}

#[test]
fn exception_stacks_are_private() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    let child = fork_pair(&kernel, &mut parent);

    let mine = kernel.pte(parent.this_env(), EXCEPTION_STACK);
    let theirs = kernel.pte(child.this_env(), EXCEPTION_STACK);
    assert_eq!(mine.flags(), PageFlags::URW);
    assert_eq!(theirs.flags(), PageFlags::URW);
    assert_ne!(mine.ppn(), theirs.ppn());
}

#[test]
fn scratch_slot_is_released() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    let child = fork_pair(&kernel, &mut parent);

    write(&child, DATA, b"c").unwrap();
    write(&parent, DATA, b"p").unwrap();
    assert!(!kernel.pte(child.this_env(), PFTEMP).is_present());
    assert!(!kernel.pte(parent.this_env(), PFTEMP).is_present());
}

#[test]
fn unexpected_faults_are_fatal() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    parent.install_fault_handler().unwrap();
    let write_fault = FaultCode::WRITE | FaultCode::USER;

    let cases = [
        (DATA, FaultCode::USER | FaultCode::PROTECTION, FaultCause::NotWrite),
        (0x4000_0000, write_fault, FaultCause::NoPageTable),
        (RODATA, write_fault | FaultCode::PROTECTION, FaultCause::NotCopyOnWrite),
        (DATA, write_fault | FaultCode::PROTECTION, FaultCause::NotCopyOnWrite),
        (UTEXT + 5 * PAGE_SIZE, write_fault, FaultCause::NotCopyOnWrite),
    ];
    for (va, err, cause) in cases {
        assert_eq!(
            parent.dispatch_fault(&UTrapframe::new(va, err)),
            Err(ForkError::Fault { va, err, cause }),
            "fault at {va:#x}"
        );
    }
    // A rejected fault on a plain writable page leaves it alone.
    let data = kernel.pte(parent.this_env(), DATA);
    assert_eq!(data.flags(), PageFlags::URW);
    assert!(!kernel.pte(parent.this_env(), PFTEMP).is_present());
}

#[test]
fn fault_without_handler_is_reported() {
    let kernel = SimKernel::new();
    let parent = boot(&kernel);
    let utf = UTrapframe::new(DATA, FaultCode::WRITE);
    assert_eq!(parent.dispatch_fault(&utf), Err(ForkError::NoHandler { va: DATA }));
}

static CUSTOM_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counting_handler(_: &Process<SimEnv>, _: &UTrapframe) -> nexus_fork::Result<()> {
    CUSTOM_CALLS.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[test]
fn later_registrations_only_swap_the_handler() {
    let kernel = SimKernel::new();
    let mut process = boot(&kernel);
    process.install_fault_handler().unwrap();
    assert_eq!(kernel.upcall(process.this_env()), Some(UPCALL));
    let stack = kernel.pte(process.this_env(), EXCEPTION_STACK);

    kernel.fail_nth(Op::PageAlloc, 1, AbiError::NoMem);
    process.set_fault_handler(counting_handler).unwrap();
    assert_eq!(kernel.pte(process.this_env(), EXCEPTION_STACK), stack);

    process.dispatch_fault(&UTrapframe::new(DATA, FaultCode::WRITE)).unwrap();
    assert_eq!(CUSTOM_CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn child_setup() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    let Spawned::Parent(id) = parent.fork().unwrap() else {
        panic!("parent must see the child id");
    };
    assert_eq!(kernel.status(id), Some(EnvStatus::Runnable));
    assert_eq!(kernel.upcall(id), Some(UPCALL));

    let mut child = parent.snapshot_with(kernel.env(id));
    assert_eq!(child.this_env(), parent.this_env(), "identity is stale before resuming");
    assert_eq!(child.fork().unwrap(), Spawned::Child);
    assert_eq!(child.this_env(), id);
}

#[test]
fn child_can_fork_again() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    let mut child = fork_pair(&kernel, &mut parent);
    let grandchild = fork_pair(&kernel, &mut child);

    write(&grandchild, DATA, b"grand").unwrap();
    assert_eq!(read(&child, DATA, 6), b"parent");
    assert_eq!(read(&grandchild, DATA, 5), b"grand");
}

#[test]
fn failed_setup_destroys_child() {
    let cases = [
        (Op::PageMap, 1, Step::Duplicate { va: DATA }),
        (Op::PageMap, 2, Step::Duplicate { va: DATA }),
        (Op::PageMap, 3, Step::Duplicate { va: RODATA }),
        (Op::PageAlloc, 2, Step::ChildStack),
        (Op::EnvSetPgfaultUpcall, 2, Step::ChildUpcall),
        (Op::EnvSetStatus, 1, Step::ChildStatus),
    ];
    for (op, nth, step) in cases {
        let kernel = SimKernel::new();
        let mut parent = populated(&kernel);
        kernel.fail_nth(op, nth, AbiError::NoMem);

        let err = parent.fork().unwrap_err();
        assert_eq!(err, ForkError::Syscall { step, err: AbiError::NoMem }, "{op:?} #{nth}");
        assert_eq!(children_of(parent.kernel()), 0, "{op:?} #{nth}");
        // Two data pages plus the parent's exception stack.
        assert_eq!(kernel.frames_in_use(), 3, "{op:?} #{nth}");
        assert_eq!(read(&parent, DATA, 6), b"parent");
    }
}

#[test]
fn teardown_failure_keeps_original_error() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    kernel.fail_nth(Op::EnvSetStatus, 1, AbiError::Inval);
    kernel.fail_nth(Op::EnvDestroy, 1, AbiError::BadEnv);

    let err = parent.fork().unwrap_err();
    assert_eq!(err, ForkError::Syscall { step: Step::ChildStatus, err: AbiError::Inval });
    assert_eq!(children_of(parent.kernel()), 1);
}

#[test]
fn handler_setup_failure_creates_no_child() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    kernel.fail_nth(Op::PageAlloc, 1, AbiError::NoMem);

    let err = parent.fork().unwrap_err();
    assert_eq!(err, ForkError::Syscall { step: Step::ExceptionStack, err: AbiError::NoMem });
    assert_eq!(children_of(parent.kernel()), 0);
}

#[test]
fn spawn_failure_is_fatal() {
    let kernel = SimKernel::new();
    let mut parent = populated(&kernel);
    kernel.fail_nth(Op::Exofork, 1, AbiError::NoFreeEnv);
    let err = parent.fork().unwrap_err();
    assert_eq!(err, ForkError::Syscall { step: Step::Spawn, err: AbiError::NoFreeEnv });
}

#[test]
fn sfork_is_unimplemented() {
    let kernel = SimKernel::new();
    let mut parent = boot(&kernel);
    assert_eq!(parent.sfork(), Err(ForkError::Unimplemented));
    assert_eq!(children_of(parent.kernel()), 0);
}

#[test]
fn destroyed_env_has_no_identity() {
    let kernel = SimKernel::new();
    let env = kernel.spawn_root(EnvType::User).unwrap();
    env.env_destroy(ENV_SELF).unwrap();
    assert_eq!(
        Process::new(env, UPCALL).err(),
        Some(ForkError::Syscall { step: Step::Identity, err: AbiError::BadEnv })
    );
}
