// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted physical frames backing the emulated address spaces.

use nexus_abi::{AbiError, SysResult, PAGE_SIZE};

struct Frame {
    bytes: Box<[u8; PAGE_SIZE]>,
    refs: usize,
}

/// Slab of frames; a frame's index is its physical page number.
pub(crate) struct FrameTable {
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    limit: Option<usize>,
    live: usize,
}

impl FrameTable {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self { frames: Vec::new(), free: Vec::new(), limit, live: 0 }
    }

    /// Allocates a zeroed frame with no references yet.
    pub(crate) fn alloc(&mut self) -> SysResult<u32> {
        if self.limit.is_some_and(|limit| self.live >= limit) {
            return Err(AbiError::NoMem);
        }
        let frame = Frame { bytes: Box::new([0; PAGE_SIZE]), refs: 0 };
        let index = match self.free.pop() {
            Some(index) => {
                self.frames[index] = Some(frame);
                index
            }
            None => {
                self.frames.push(Some(frame));
                self.frames.len() - 1
            }
        };
        self.live += 1;
        u32::try_from(index).map_err(|_| AbiError::NoMem)
    }

    pub(crate) fn incref(&mut self, ppn: u32) {
        if let Some(frame) = self.frame_mut(ppn) {
            frame.refs += 1;
        }
    }

    /// Drops one reference; the frame is released when none remain.
    pub(crate) fn decref(&mut self, ppn: u32) {
        let index = ppn as usize;
        let Some(frame) = self.frame_mut(ppn) else { return };
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 {
            self.frames[index] = None;
            self.free.push(index);
            self.live -= 1;
        }
    }

    pub(crate) fn refs(&self, ppn: u32) -> usize {
        self.frame(ppn).map_or(0, |frame| frame.refs)
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn bytes(&self, ppn: u32) -> Option<&[u8; PAGE_SIZE]> {
        self.frame(ppn).map(|frame| &*frame.bytes)
    }

    pub(crate) fn bytes_mut(&mut self, ppn: u32) -> Option<&mut [u8; PAGE_SIZE]> {
        self.frame_mut(ppn).map(|frame| &mut *frame.bytes)
    }

    pub(crate) fn copy(&mut self, dst: u32, src: u32) -> SysResult<()> {
        if dst == src {
            return Ok(());
        }
        let data = *self.bytes(src).ok_or(AbiError::Fault)?;
        *self.bytes_mut(dst).ok_or(AbiError::Fault)? = data;
        Ok(())
    }

    fn frame(&self, ppn: u32) -> Option<&Frame> {
        self.frames.get(ppn as usize).and_then(Option::as_ref)
    }

    fn frame_mut(&mut self, ppn: u32) -> Option<&mut Frame> {
        self.frames.get_mut(ppn as usize).and_then(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_reference_releases_frame() {
        let mut table = FrameTable::new(None);
        let ppn = table.alloc().unwrap();
        table.incref(ppn);
        table.incref(ppn);
        assert_eq!(table.refs(ppn), 2);
        table.decref(ppn);
        assert_eq!(table.live(), 1);
        table.decref(ppn);
        assert_eq!(table.live(), 0);
        assert!(table.bytes(ppn).is_none());
    }

    #[test]
    fn limit_reports_out_of_memory() {
        let mut table = FrameTable::new(Some(1));
        let ppn = table.alloc().unwrap();
        table.incref(ppn);
        assert_eq!(table.alloc(), Err(AbiError::NoMem));
    }

    #[test]
    fn freed_slots_are_reused_zeroed() {
        let mut table = FrameTable::new(None);
        let ppn = table.alloc().unwrap();
        table.incref(ppn);
        table.bytes_mut(ppn).unwrap()[0] = 0xaa;
        table.decref(ppn);
        let again = table.alloc().unwrap();
        assert_eq!(again, ppn);
        assert_eq!(table.bytes(again).unwrap()[0], 0);
    }
}
