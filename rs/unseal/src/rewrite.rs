//! Post-decryption fragment rewriting.
//!
//! Once the samples are plaintext, the encryption sidecars are dead weight:
//! `senc` (plain and PIFF UUID), `saiz`, `saio`, the `seam`/`seig` grouping
//! boxes, and any `pssh`. Removing them shrinks the moof, so every
//! `trun.data_offset` must drop by the total bytes removed to keep pointing
//! at the same mdat bytes.

use tracing::trace;

use crate::boxes::{Fragment, MediaBox, PSSH, SAIO, SAIZ, SEAM, SEIG, Senc, TRAF};
use crate::Result;

/// Rewrite the fragment in place. The mdat is never touched.
pub fn rewrite_fragment(frag: &mut Fragment) -> Result<()> {
	let mut removed = 0u64;

	for traf in frag.moof.containers_mut(TRAF) {
		removed += traf.remove_children(|child| match child {
			MediaBox::Raw(raw) => {
				raw.kind == Senc::KIND
					|| raw.kind == SAIZ
					|| raw.kind == SAIO
					|| raw.is_uuid_senc()
					|| matches!(raw.grouping_type(), Some(grouping) if grouping == SEAM || grouping == SEIG)
			}
			_ => false,
		});
	}

	removed += frag.moof.remove_children(|child| child.kind() == PSSH);

	if removed == 0 {
		return Ok(());
	}

	for traf in frag.moof.containers_mut(TRAF) {
		for trun in traf.children.iter_mut().filter_map(|child| match child {
			MediaBox::Trun(trun) => Some(trun),
			_ => None,
		}) {
			if let Some(offset) = trun.data_offset.as_mut() {
				*offset -= removed as i32;
				// A negative offset would point before the moof; the
				// accounting above must match the bytes actually dropped.
				debug_assert!(*offset >= 0, "data offset went negative after rewrite");
			}
		}
	}

	trace!(removed, "fragment rewritten");
	Ok(())
}
