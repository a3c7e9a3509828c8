//! Media-playlist filtering and decoding.
//!
//! The playlist is pre-filtered at the line level before structural parsing:
//! `#EXT-X-KEY` tags that do not reference the accepted key-delivery scheme
//! are dropped as text. This is deliberately not a structural filter so that
//! unknown future key tags cannot break the parse.

use m3u8_rs::Playlist;

use crate::{Error, Result};

/// Substring identifying key tags we keep; everything else is stripped.
const KEY_DELIVERY_SCHEME: &[u8] = b"streamingkeydelivery";

const KEY_TAG_PREFIX: &[u8] = b"#EXT-X-KEY:";

/// Sentinel key URI meaning "no asset context yet"; transmitted to the key
/// service with content id `"0"`.
pub const PREFETCH_KEY_URI: &str = "skd://itunes.apple.com/P000000000/s1/e1";

/// One playlist entry; 1:1 with a fragment in the media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
	pub index: usize,
	/// Media-file URI, relative to the playlist. Byterange playlists point
	/// every segment at the same file.
	pub uri: String,
	/// Inclusive byte range within the media file.
	pub start: u64,
	pub end: u64,
	/// Present only on segments where the playlist introduced a key.
	pub key: Option<SegmentKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
	pub uri: String,
	pub iv: Option<Vec<u8>>,
}

impl SegmentKey {
	pub fn is_prefetch(&self) -> bool {
		self.uri == PREFETCH_KEY_URI
	}
}

/// Drop `#EXT-X-KEY` lines that do not mention the accepted delivery scheme.
pub fn filter_key_tags(raw: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(raw.len());

	for line in raw.split(|&b| b == b'\n') {
		let line = line.strip_suffix(b"\r").unwrap_or(line);
		if line.starts_with(KEY_TAG_PREFIX) && !contains(line, KEY_DELIVERY_SCHEME) {
			continue;
		}
		out.extend_from_slice(line);
		out.push(b'\n');
	}

	out
}

/// Decode a filtered media playlist into an ordered segment list.
///
/// Validates the byte-range invariants: every segment carries a range, the
/// first starts at zero, and the ranges cover a contiguous prefix of the
/// media file.
pub fn decode(raw: &[u8]) -> Result<Vec<Segment>> {
	let filtered = filter_key_tags(raw);

	let playlist = m3u8_rs::parse_playlist_res(&filtered).map_err(|err| Error::PlaylistParse(err.to_string()))?;

	let media = match playlist {
		Playlist::MediaPlaylist(media) => media,
		Playlist::MasterPlaylist(_) => return Err(Error::PlaylistNotMedia),
	};

	if media.segments.is_empty() {
		return Err(Error::NoSegments);
	}

	let mut segments = Vec::with_capacity(media.segments.len());
	let mut cursor = 0u64;

	for (index, segment) in media.segments.iter().enumerate() {
		let range = segment
			.byte_range
			.as_ref()
			.filter(|range| range.length > 0)
			.ok_or(Error::NonByterangePlaylist(index))?;

		let start = range.offset.unwrap_or(cursor);
		if start != cursor {
			return Err(Error::GappedRanges {
				index,
				start,
				expected: cursor,
			});
		}
		let end = start + range.length - 1;
		cursor = end + 1;

		let key = match &segment.key {
			Some(key) => Some(SegmentKey {
				uri: key.uri.clone().unwrap_or_default(),
				iv: key.iv.as_deref().map(decode_iv).transpose()?,
			}),
			None => None,
		};

		segments.push(Segment {
			index,
			uri: segment.uri.clone(),
			start,
			end,
			key,
		});
	}

	Ok(segments)
}

fn decode_iv(iv: &str) -> Result<Vec<u8>> {
	let hex = iv.strip_prefix("0x").or_else(|| iv.strip_prefix("0X")).unwrap_or(iv);
	hex::decode(hex).map_err(|err| Error::PlaylistParse(format!("bad key iv {iv:?}: {err}")))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
	haystack.windows(needle.len()).any(|window| window == needle)
}
