// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault handler registration and the copy-on-write handler.

use nexus_abi::{
    page_number, pt_index, round_down, FaultCode, Kernel, PageFlags, UTrapframe, ENV_SELF,
    EXCEPTION_STACK, PFTEMP,
};

use crate::{at, FaultCause, FaultHandler, ForkError, Process, Result, Step};

impl<K: Kernel> Process<K> {
    /// Registers `handler` for this environment's page faults.
    ///
    /// The first registration also maps the exception stack and points the kernel at the
    /// upcall entry; later ones only replace the handler.
    pub fn set_fault_handler(&mut self, handler: FaultHandler<K>) -> Result<()> {
        if self.handler.is_none() {
            self.kernel
                .page_alloc(ENV_SELF, EXCEPTION_STACK, PageFlags::URW)
                .map_err(at(Step::ExceptionStack))?;
            self.kernel
                .env_set_pgfault_upcall(ENV_SELF, self.upcall)
                .map_err(at(Step::RegisterUpcall))?;
            log::debug!("fork: env {:#x} fault upcall at {:#x}", self.this_env, self.upcall);
        }
        self.handler = Some(handler);
        Ok(())
    }

    /// Registers [`cow_fault`].
    pub fn install_fault_handler(&mut self) -> Result<()> {
        self.set_fault_handler(cow_fault::<K>)
    }

    /// Runs the registered handler for `utf`; this is what the upcall trampoline calls.
    pub fn dispatch_fault(&self, utf: &UTrapframe) -> Result<()> {
        let handler = self.handler.ok_or(ForkError::NoHandler { va: utf.fault_va })?;
        handler(self, utf).inspect_err(|err| {
            log::error!("fork: env {:#x} pc {:#x}: {err}", self.this_env, utf.pc);
        })
    }
}

/// Resolves a write to a copy-on-write page by giving the faulting environment its own
/// writable copy.
///
/// Anything else (a read, an address without a page table, a page not marked
/// copy-on-write) is reported as [`ForkError::Fault`].
pub fn cow_fault<K: Kernel>(process: &Process<K>, utf: &UTrapframe) -> Result<()> {
    let va = utf.fault_va;
    let reject = |cause| ForkError::Fault { va, err: utf.err, cause };
    let kernel = process.kernel();

    if !utf.err.contains(FaultCode::WRITE) {
        return Err(reject(FaultCause::NotWrite));
    }
    if !kernel.uvpd(pt_index(va)).is_present() {
        return Err(reject(FaultCause::NoPageTable));
    }
    if !kernel.uvpt(page_number(va)).flags().is_cow() {
        return Err(reject(FaultCause::NotCopyOnWrite));
    }

    let page = round_down(va);
    kernel.page_alloc(ENV_SELF, PFTEMP, PageFlags::URW).map_err(at(Step::ScratchAlloc))?;
    kernel.copy_page(PFTEMP, page).map_err(at(Step::ScratchCopy))?;
    kernel
        .page_map(ENV_SELF, PFTEMP, ENV_SELF, page, PageFlags::URW)
        .map_err(at(Step::ScratchMap))?;
    kernel.page_unmap(ENV_SELF, PFTEMP).map_err(at(Step::ScratchUnmap))?;
    log::trace!("fork: env {:#x} copied page {page:#x}", process.this_env());
    Ok(())
}
