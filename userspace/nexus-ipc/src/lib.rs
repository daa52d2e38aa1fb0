// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC transport and environment directory lookup
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (retry policy) + integration tests against nexus-sim
//!
//! PUBLIC API:
//!   - recv(): block for one message, optionally accepting a page
//!   - send()/send_with(): deliver one message, retrying while the target is not receiving
//!   - find_env(): first live environment with a given role
//!   - Retry/Yield: retry policy and scheduling hook
//!   - IpcError: transport errors
//!
//! DEPENDENCIES:
//!   - nexus-abi: syscall and environment-table traits
//!   - thiserror: error derive (no_std)
//!   - log: contention and failure diagnostics

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod budget;

pub use budget::{retry_while_not_receiving, KernelYield, Retry, Yield};

use nexus_abi::{
    envx, AbiError, EnvId, EnvTable, EnvType, PageFlags, Syscalls, NENV, NO_PAGE,
};

/// Result type returned by the send side.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors surfaced by the send side of the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    /// The kernel rejected the request with something other than contention.
    #[error("ipc rejected by kernel: {0}")]
    Kernel(#[from] AbiError),
    /// The receiver never became ready within the retry policy.
    #[error("receiver not waiting after {attempts} attempts")]
    Exhausted {
        /// Number of `ipc_try_send` calls made.
        attempts: u32,
    },
}

/// Page attached to an outgoing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    /// Page-aligned address in the sender's address space.
    pub va: usize,
    /// Permission the receiver gets.
    pub perm: PageFlags,
}

impl Page {
    /// Attaches the page at `va` with `perm`.
    pub const fn new(va: usize, perm: PageFlags) -> Self {
        Self { va, perm }
    }
}

/// A delivered message, read back from the receiver's environment record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    /// Message value.
    pub value: u32,
    /// Sender.
    pub from: EnvId,
    /// Permission of the transferred page; empty when no page was mapped.
    pub perm: PageFlags,
}

impl Received {
    /// Returns `true` when a page was mapped at the receive address.
    pub fn page_transferred(&self) -> bool {
        !self.perm.is_empty()
    }
}

/// Blocks until a message arrives for `me`.
///
/// `me` must be the caller's current identity; a stale one (say, cached before a fork)
/// fails with [`AbiError::BadEnv`] before anything is received. With `dst` set, a page
/// the sender attaches is mapped there. Without it the kernel is told that no page is
/// wanted. A kernel error is returned as is and no sender or permission is reported;
/// the caller decides whether that is fatal.
pub fn recv<K>(
    kernel: &K,
    me: EnvId,
    dst: Option<usize>,
) -> core::result::Result<Received, AbiError>
where
    K: Syscalls + EnvTable + ?Sized,
{
    let current = kernel.getenvid()?;
    if current != me {
        log::warn!("ipc: recv for {me:#x} called by {current:#x}");
        return Err(AbiError::BadEnv);
    }
    let dst_va = dst.unwrap_or(NO_PAGE);
    if let Err(err) = kernel.ipc_recv(dst_va) {
        log::debug!("ipc: recv at {dst_va:#x} failed: {err}");
        return Err(err);
    }
    let record = kernel.env_at(envx(me)).filter(|info| info.id == me).ok_or(AbiError::BadEnv)?;
    Ok(Received { value: record.ipc_value, from: record.ipc_from, perm: record.ipc_perm })
}

/// Sends `value` (and `page`, if any) to `to`, yielding until the receiver is ready.
pub fn send<K>(kernel: &K, to: EnvId, value: u32, page: Option<Page>) -> Result<()>
where
    K: Syscalls + ?Sized,
{
    send_with(kernel, &KernelYield(kernel), Retry::Forever, to, value, page)
}

/// Like [`send`] with an explicit scheduling hook and retry policy.
pub fn send_with<K>(
    kernel: &K,
    sched: &impl Yield,
    policy: Retry,
    to: EnvId,
    value: u32,
    page: Option<Page>,
) -> Result<()>
where
    K: Syscalls + ?Sized,
{
    let (src_va, perm) = page.map_or((NO_PAGE, PageFlags::empty()), |page| (page.va, page.perm));
    retry_while_not_receiving(sched, policy, || kernel.ipc_try_send(to, value, src_va, perm))
        .inspect_err(|err| log::error!("ipc: send to {to:#x} failed: {err}"))
}

/// Identifier of the lowest-indexed live environment tagged `env_type`.
pub fn find_env<T: EnvTable + ?Sized>(table: &T, env_type: EnvType) -> Option<EnvId> {
    (0..NENV)
        .filter_map(|index| table.env_at(index))
        .find(|info| info.env_type == env_type)
        .map(|info| info.id)
}
