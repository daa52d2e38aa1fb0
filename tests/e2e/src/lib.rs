// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the end-to-end scenarios: boot environments on the emulated kernel,
//! resume the child side of a fork, and perform user writes with fault delivery.

#![forbid(unsafe_code)]

use nexus_abi::{EnvId, EnvType, Spawned, UTEXT};
use nexus_fork::{ForkError, Process, Step};
use nexus_sim::{SimEnv, SimFault, SimKernel};

/// Upcall entry address used by every booted process.
pub const UPCALL: usize = UTEXT + 0x40;

/// Boots a process of role `env_type`.
pub fn boot(kernel: &SimKernel, env_type: EnvType) -> nexus_fork::Result<Process<SimEnv>> {
    let env = kernel
        .spawn_root(env_type)
        .map_err(|err| ForkError::Syscall { step: Step::Spawn, err })?;
    log::debug!("e2e: booted {env:?} as {env_type:?}");
    Process::new(env, UPCALL)
}

/// Resumes the child `id` of `parent` the way the child would: from its copy of the
/// parent's context, returning from its own `fork` call.
pub fn resume_child(
    kernel: &SimKernel,
    parent: &Process<SimEnv>,
    id: EnvId,
) -> nexus_fork::Result<Process<SimEnv>> {
    let mut child = parent.snapshot_with(kernel.env(id));
    let resumed = child.fork()?;
    debug_assert_eq!(resumed, Spawned::Child);
    Ok(child)
}

/// Stores `bytes` at `va` in `process`, routing page faults through its handler.
pub fn write(process: &Process<SimEnv>, va: usize, bytes: &[u8]) -> Result<(), SimFault> {
    process.kernel().store(va, bytes, &mut |utf| process.dispatch_fault(utf).is_ok())
}

/// Loads `len` bytes at `va` in `process`.
pub fn read(process: &Process<SimEnv>, va: usize, len: usize) -> Result<Vec<u8>, SimFault> {
    process.kernel().load(va, len)
}
