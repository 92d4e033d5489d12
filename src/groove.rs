// src/groove.rs
//
// Groove template lookup: a short sequence of signed tick offsets
// referenced by the GROOVE_PTR/GROOVE_LEN registers, sampled by the
// playhead as a step function of `baseTick`.

use std::sync::atomic::Ordering;

use crate::buffer::SharedBuffer;
use crate::header::HeaderView;

/// Ticks per groove step. A sixteenth note at the kernel's PPQ is the
/// natural grain for a rhythmic groove table, so that's what's used
/// here.
fn step_size(header: &HeaderView) -> u32 {
    (header.ppq() / 4).max(1)
}

/// Sample the groove table for `base_tick`. Zero when no groove is set
/// (`GROOVE_PTR == 0`).
pub fn groove_offset(buf: &SharedBuffer, base_tick: u32) -> i32 {
    let header = HeaderView::new(buf);
    let len = header.groove_len();
    if header.groove_ptr() == 0 || len == 0 {
        return 0;
    }

    let step = step_size(&header);
    let index = (base_tick / step) % len;
    let cell = buf.layout.groove_cell(index as usize);
    buf.load(cell, Ordering::Relaxed) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{init_header, RegisterWriter};
    use crate::layout::KernelLayout;

    #[test]
    fn zero_groove_ptr_means_no_offset() {
        let layout = KernelLayout::new(16, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 0);
        assert_eq!(groove_offset(&buf, 1000), 0);
    }

    #[test]
    fn groove_wraps_and_is_indexed_by_step() {
        let layout = KernelLayout::new(16, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 0);
        let writer = RegisterWriter::new(&buf);
        writer.write_groove_template(&layout, &[10, -5, 3]);

        let step = 960 / 4; // 240
        assert_eq!(groove_offset(&buf, 0), 10);
        assert_eq!(groove_offset(&buf, step), -5);
        assert_eq!(groove_offset(&buf, step * 2), 3);
        assert_eq!(groove_offset(&buf, step * 3), 10); // wraps
    }
}
