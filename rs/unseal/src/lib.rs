//! # unseal: streaming CBCS fMP4 decryption
//!
//! `unseal` turns a byterange HLS playlist of CBCS-protected fragmented MP4
//! into a fully decrypted, sanitized fMP4 file. The heavy lifting:
//!
//! - **Playlist**: textual key-tag filtering and media-playlist decoding.
//! - **Download**: parallel ranged GETs into a resumable scratch file, or a
//!   lazy streaming byte source.
//! - **Boxes**: a streaming ISO-BMFF reader and an owned, rewritable box tree.
//! - **Keys**: a length-prefixed TCP session against an external key service,
//!   used as the decryption oracle.
//! - **Decrypt**: sample-accurate CBCS with full-subsample and stripe modes.
//! - **Rewrite**: encryption-box removal with `trun.data_offset` fix-up.
//! - **Pipeline**: the orchestrator tying it together with account fallback.
//!
//! The entry point is [run]; everything it needs is passed in explicitly.

mod error;
mod metrics;
mod pipeline;

pub mod boxes;
pub mod decrypt;
pub mod download;
pub mod init;
pub mod keys;
pub mod playlist;
pub mod progress;
pub mod rewrite;
pub mod source;

// export the container crate in use
pub use mp4_atom;

pub use error::*;
pub use metrics::*;
pub use pipeline::*;
