// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Raw syscall backend for user environments running on the kernel
//! OWNERS: @runtime
//! STATUS: Functional on riscv64-none; every call reports `Unsupported` elsewhere
//!
//! The page-table view and the environment table are read straight out of the
//! kernel's read-only user mappings at [`UVPT`] and [`UENVS`].

use crate::{
    AbiError, EnvId, EnvInfo, EnvStatus, EnvTable, PageFlags, Spawned, SysResult, Syscalls,
    UserMemory, VmView, Pte,
};
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::{EnvType, NENV, NPTENTRIES, PAGE_SIZE, UENVS, UVPT};

const SYS_GETENVID: usize = 2;
const SYS_ENV_DESTROY: usize = 3;
const SYS_PAGE_ALLOC: usize = 4;
const SYS_PAGE_MAP: usize = 5;
const SYS_PAGE_UNMAP: usize = 6;
const SYS_EXOFORK: usize = 7;
const SYS_ENV_SET_STATUS: usize = 8;
const SYS_ENV_SET_PGFAULT_UPCALL: usize = 10;
const SYS_YIELD: usize = 11;
const SYS_IPC_TRY_SEND: usize = 12;
const SYS_IPC_RECV: usize = 13;

/// Layout of one slot of the environment table mapped at [`UENVS`].
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawEnv {
    /// Environment id.
    pub id: u32,
    /// Parent id.
    pub parent: u32,
    /// Raw [`EnvType`].
    pub env_type: u32,
    /// Raw [`EnvStatus`].
    pub status: u32,
    /// Non-zero while blocked in `ipc_recv`.
    pub ipc_recving: u32,
    /// Destination address of the pending receive.
    pub ipc_dstva: usize,
    /// Last delivered value.
    pub ipc_value: u32,
    /// Last sender.
    pub ipc_from: u32,
    /// Raw permission of the last transferred page.
    pub ipc_perm: u32,
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl RawEnv {
    fn decode(&self) -> Option<EnvInfo> {
        let status = EnvStatus::from_raw(self.status)?;
        if status == EnvStatus::Free {
            return None;
        }
        Some(EnvInfo {
            id: self.id,
            parent: self.parent,
            env_type: EnvType::from_raw(self.env_type)?,
            status,
            ipc_recving: self.ipc_recving != 0,
            ipc_value: self.ipc_value,
            ipc_from: self.ipc_from,
            ipc_perm: PageFlags::from_bits_truncate(self.ipc_perm),
        })
    }
}

/// The running kernel, reached through `ecall`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsKernel;

impl Syscalls for OsKernel {
    fn getenvid(&self) -> SysResult<EnvId> {
        syscall(SYS_GETENVID, [0; 5]).map(|id| id as EnvId)
    }

    fn yield_(&self) {
        let _ = syscall(SYS_YIELD, [0; 5]);
    }

    fn exofork(&self) -> SysResult<Spawned> {
        match syscall(SYS_EXOFORK, [0; 5])? {
            0 => Ok(Spawned::Child),
            id => Ok(Spawned::Parent(id as EnvId)),
        }
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        syscall(SYS_ENV_SET_STATUS, [env as usize, status as usize, 0, 0, 0]).map(drop)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()> {
        syscall(SYS_ENV_SET_PGFAULT_UPCALL, [env as usize, entry, 0, 0, 0]).map(drop)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        syscall(SYS_ENV_DESTROY, [env as usize, 0, 0, 0, 0]).map(drop)
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PageFlags) -> SysResult<()> {
        syscall(SYS_PAGE_ALLOC, [env as usize, va, perm.bits() as usize, 0, 0]).map(drop)
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PageFlags,
    ) -> SysResult<()> {
        syscall(
            SYS_PAGE_MAP,
            [src_env as usize, src_va, dst_env as usize, dst_va, perm.bits() as usize],
        )
        .map(drop)
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()> {
        syscall(SYS_PAGE_UNMAP, [env as usize, va, 0, 0, 0]).map(drop)
    }

    fn ipc_try_send(&self, to: EnvId, value: u32, src_va: usize, perm: PageFlags) -> SysResult<()> {
        syscall(
            SYS_IPC_TRY_SEND,
            [to as usize, value as usize, src_va, perm.bits() as usize, 0],
        )
        .map(drop)
    }

    fn ipc_recv(&self, dst_va: usize) -> SysResult<()> {
        syscall(SYS_IPC_RECV, [dst_va, 0, 0, 0, 0]).map(drop)
    }
}

impl VmView for OsKernel {
    fn uvpd(&self, pdx: usize) -> Pte {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            // The page directory maps itself at slot `UVPT >> PT_SHIFT` of the view.
            let uvpd = UVPT + (UVPT >> 12) * core::mem::size_of::<u32>();
            if pdx >= NPTENTRIES {
                return Pte::EMPTY;
            }
            // SAFETY: the kernel keeps the recursive page-directory view mapped read-only
            // for every environment and `pdx` is bounds-checked above.
            Pte::from_raw(unsafe { core::ptr::read_volatile((uvpd as *const u32).add(pdx)) })
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            let _ = pdx;
            Pte::EMPTY
        }
    }

    fn uvpt(&self, pn: usize) -> Pte {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            if !self.uvpd(pn / NPTENTRIES).is_present() {
                return Pte::EMPTY;
            }
            // SAFETY: the page table covering `pn` is present (checked above), so its entry
            // is readable through the recursive view.
            Pte::from_raw(unsafe { core::ptr::read_volatile((UVPT as *const u32).add(pn)) })
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            let _ = pn;
            Pte::EMPTY
        }
    }
}

impl EnvTable for OsKernel {
    fn env_at(&self, index: usize) -> Option<EnvInfo> {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            if index >= NENV {
                return None;
            }
            // SAFETY: the kernel maps `NENV` records read-only at UENVS in every environment.
            let raw = unsafe { core::ptr::read_volatile((UENVS as *const RawEnv).add(index)) };
            raw.decode()
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            let _ = index;
            None
        }
    }
}

impl UserMemory for OsKernel {
    fn copy_page(&self, dst_va: usize, src_va: usize) -> SysResult<()> {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            if dst_va % PAGE_SIZE != 0 || src_va % PAGE_SIZE != 0 || dst_va == src_va {
                return Err(AbiError::Inval);
            }
            // SAFETY: both addresses are distinct, page aligned and mapped by the caller
            // (the fault handler maps the destination immediately before copying).
            unsafe {
                core::ptr::copy_nonoverlapping(src_va as *const u8, dst_va as *mut u8, PAGE_SIZE)
            };
            Ok(())
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            let _ = (dst_va, src_va);
            Err(AbiError::Unsupported)
        }
    }
}

fn syscall(n: usize, args: [usize; 5]) -> SysResult<usize> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        // SAFETY: forwards raw register arguments to the kernel; the result is decoded below.
        let raw = unsafe { ecall5(n, args[0], args[1], args[2], args[3], args[4]) };
        decode_syscall(raw)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (n, args);
        Err(AbiError::Unsupported)
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn decode_syscall(value: usize) -> SysResult<usize> {
    let signed = value as isize;
    if signed < 0 {
        Err(AbiError::from_code(signed.unsigned_abs() as i32))
    } else {
        Ok(value)
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall5(n: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r3 = a3;
    let mut r4 = a4;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a3") r3,
        inout("a4") r4,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}
