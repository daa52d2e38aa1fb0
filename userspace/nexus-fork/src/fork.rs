// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fork orchestration.
//!
//! ```text
//! install handler -> exofork -+-> child: refresh identity, return Child
//!                             +-> parent: duplicate [UTEXT, UTOP) minus exception stack
//!                                         -> child exception stack -> child upcall
//!                                         -> child runnable -> return Parent(id)
//! ```
//! A failure after the child exists destroys it before the error is returned.

use nexus_abi::{
    page_number, pt_index, EnvId, EnvStatus, Kernel, PageFlags, Spawned, EXCEPTION_STACK,
    NPTENTRIES, UTEXT, UTOP,
};

use crate::{at, ForkError, Process, Result, Sharing, Step};

impl<K: Kernel> Process<K> {
    /// Duplicates the calling environment with copy-on-write sharing.
    ///
    /// Returns once in each environment: [`Spawned::Parent`] with the child's id in the
    /// caller, [`Spawned::Child`] in the child, whose identity is refreshed first.
    pub fn fork(&mut self) -> Result<Spawned> {
        self.install_fault_handler()?;

        let child = match self.kernel.exofork().map_err(at(Step::Spawn))? {
            Spawned::Child => {
                let me = self.refresh_identity()?;
                log::debug!("fork: running as child {me:#x}");
                return Ok(Spawned::Child);
            }
            Spawned::Parent(child) => child,
        };

        if let Err(err) = self.populate(child) {
            log::error!("fork: child {child:#x} setup failed: {err}");
            if let Err(teardown) = self.kernel.env_destroy(child) {
                log::warn!("fork: could not destroy child {child:#x}: {teardown}");
            }
            return Err(err);
        }
        log::debug!("fork: env {:#x} -> child {child:#x}", self.this_env);
        Ok(Spawned::Parent(child))
    }

    /// Shared-memory fork. Not supported.
    pub fn sfork(&mut self) -> Result<Spawned> {
        Err(ForkError::Unimplemented)
    }

    fn populate(&self, child: EnvId) -> Result<()> {
        let stack_pn = page_number(EXCEPTION_STACK);
        let (mut read_only, mut cow) = (0usize, 0usize);

        for pdx in pt_index(UTEXT)..pt_index(UTOP) {
            if !self.kernel.uvpd(pdx).is_present() {
                continue;
            }
            for pn in pdx * NPTENTRIES..(pdx + 1) * NPTENTRIES {
                if pn == stack_pn || !self.kernel.uvpt(pn).flags().contains(PageFlags::UR) {
                    continue;
                }
                match self.duppage(child, pn)? {
                    Sharing::ReadOnly => read_only += 1,
                    Sharing::CopyOnWrite => cow += 1,
                }
            }
        }
        log::trace!("fork: child {child:#x}: {read_only} read-only, {cow} copy-on-write pages");

        self.kernel
            .page_alloc(child, EXCEPTION_STACK, PageFlags::URW)
            .map_err(at(Step::ChildStack))?;
        self.kernel
            .env_set_pgfault_upcall(child, self.upcall)
            .map_err(at(Step::ChildUpcall))?;
        self.kernel.env_set_status(child, EnvStatus::Runnable).map_err(at(Step::ChildStatus))?;
        Ok(())
    }
}
