// src/commit.rs
//
// The IDLE/PENDING/ACK commit handshake between Worker and Audio
// (spec.md §4.7). `CommitState` and the raw register live in `header.rs`;
// this module is the thin state-machine wrapper that names the three
// legal transitions so call sites read as protocol steps rather than
// raw register pokes.

use crate::header::{CommitState, HeaderView};

/// Worker-side: called after any structural mutation (insert, delete,
/// connect, disconnect). Idempotent — re-marking PENDING while already
/// PENDING is a no-op in effect.
pub fn mark_pending(header: &HeaderView) {
    header.set_commit_flag(CommitState::Pending);
}

/// Audio-side: called once per quantum after the playhead has resynced
/// its cursor against a PENDING commit. One-way — Audio never reads ACK
/// back to PENDING itself.
pub fn acknowledge(header: &HeaderView) {
    header.set_commit_flag(CommitState::Ack);
}

/// Composer/Worker-side hint: treat a seen ACK as "safe to go back to
/// IDLE before the next mutation" (spec.md §4.7). Purely cosmetic — the
/// protocol doesn't require IDLE to ever be observed again.
pub fn reset_if_acked(header: &HeaderView) {
    if header.commit_flag() == CommitState::Ack {
        header.set_commit_flag(CommitState::Idle);
    }
}

/// Whether the Audio thread needs to resync its playback cursor this
/// quantum.
pub fn needs_resync(header: &HeaderView) -> bool {
    header.commit_flag() == CommitState::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBuffer;
    use crate::header::init_header;
    use crate::layout::KernelLayout;

    #[test]
    fn full_handshake_cycle() {
        let layout = KernelLayout::new(16, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 0);
        let header = HeaderView::new(&buf);

        assert!(!needs_resync(&header));
        mark_pending(&header);
        assert!(needs_resync(&header));
        acknowledge(&header);
        assert!(!needs_resync(&header));
        assert_eq!(header.commit_flag(), CommitState::Ack);
        reset_if_acked(&header);
        assert_eq!(header.commit_flag(), CommitState::Idle);
    }
}
