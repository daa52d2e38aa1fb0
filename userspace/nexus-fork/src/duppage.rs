// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use nexus_abi::{page_address, EnvId, Kernel, PageFlags, ENV_SELF};

use crate::{at, Process, Result, Sharing, Step};

impl<K: Kernel> Process<K> {
    /// Shares page number `pn` with `child`.
    ///
    /// Read-only pages are mapped read-only into the child and stay as they are here.
    /// Writable and copy-on-write pages become copy-on-write in both, child first.
    pub fn duppage(&self, child: EnvId, pn: usize) -> Result<Sharing> {
        let va = page_address(pn);
        let step = Step::Duplicate { va };
        let flags = self.kernel.uvpt(pn).flags();

        if !flags.intersects(PageFlags::WRITABLE | PageFlags::COW) {
            self.kernel.page_map(ENV_SELF, va, child, va, PageFlags::UR).map_err(at(step))?;
            return Ok(Sharing::ReadOnly);
        }
        self.kernel.page_map(ENV_SELF, va, child, va, PageFlags::UCOW).map_err(at(step))?;
        // The parent's own mapping must turn copy-on-write too, or its next write would
        // show through in the child.
        self.kernel.page_map(ENV_SELF, va, ENV_SELF, va, PageFlags::UCOW).map_err(at(step))?;
        Ok(Sharing::CopyOnWrite)
    }
}
