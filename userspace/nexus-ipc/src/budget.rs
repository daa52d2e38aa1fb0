// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Retry loop for sends that hit a receiver which is not yet waiting.
//!
//! The kernel offers only a non-blocking `ipc_try_send`; contention is reported as
//! `AbiError::IpcNotRecv`. Callers give the loop a [`Yield`] hook and a [`Retry`] policy.
//! Every other kernel error ends the loop immediately.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)

use nexus_abi::{AbiError, SysResult, Syscalls};

use crate::{IpcError, Result};

/// Scheduling hook invoked between attempts.
pub trait Yield {
    /// Gives other environments a chance to run.
    fn yield_now(&self);
}

/// Yields through the kernel's `yield_` syscall.
pub struct KernelYield<'a, K: ?Sized>(pub &'a K);

impl<K: Syscalls + ?Sized> Yield for KernelYield<'_, K> {
    fn yield_now(&self) {
        self.0.yield_();
    }
}

/// How long a send keeps trying while the receiver is busy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Retry {
    /// Until the receiver shows up.
    #[default]
    Forever,
    /// At most this many attempts in total (a value of 0 still makes one attempt).
    Attempts(u32),
}

impl Retry {
    /// Returns `true` if another attempt is allowed after `attempts` failed ones.
    pub const fn permits(self, attempts: u32) -> bool {
        match self {
            Self::Forever => true,
            Self::Attempts(max) => attempts < max,
        }
    }
}

/// Runs `op` until it succeeds, fails with something other than `IpcNotRecv`, or `policy`
/// runs out.
pub fn retry_while_not_receiving<T>(
    sched: &impl Yield,
    policy: Retry,
    mut op: impl FnMut() -> SysResult<T>,
) -> Result<T> {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match op() {
            Ok(v) => return Ok(v),
            Err(AbiError::IpcNotRecv) => {
                if !policy.permits(attempts) {
                    return Err(IpcError::Exhausted { attempts });
                }
                log::trace!("ipc: receiver busy (attempt {attempts}), yielding");
                sched.yield_now();
            }
            Err(err) => return Err(IpcError::Kernel(err)),
        }
    }
}
