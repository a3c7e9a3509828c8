//! Init-segment transformation.
//!
//! Walks the `moov`, enforces the single-track and cbcs invariants, builds
//! the read-only track table, restores protected sample entries to their
//! original format, and strips everything encryption-related so the init can
//! be written to the output as-is.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use mp4_atom::{Atom, Encode, FourCC};
use tracing::debug;

use crate::boxes::{
	Container, ENCA, ENCV, Frma, Init, MDIA, MINF, MVEX, MediaBox, PSSH, RawBox, SCHI, SEAM, SEIG, SINF, STBL, STSD,
	Schm, TKHD, TRAK, Tenc, Trex, decode_raw, parse_container, split_boxes,
};
use crate::{Error, Result};

pub const CBCS: FourCC = FourCC::new(b"cbcs");

/// Fixed-size sample-entry prefixes preceding the child boxes.
const AUDIO_ENTRY_PREFIX: usize = 28;
const VISUAL_ENTRY_PREFIX: usize = 78;

#[derive(Debug, Clone)]
pub struct TrackCrypto {
	pub scheme: FourCC,
	pub tenc: Tenc,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
	pub trex: Trex,
	/// `None` for tracks that carry no protection scheme; their samples pass
	/// through untouched.
	pub crypto: Option<TrackCrypto>,
}

pub type TrackTable = HashMap<u32, TrackInfo>;

/// Transform the init in place and return the track table.
pub fn transform(init: &mut Init) -> Result<TrackTable> {
	let moov = &mut init.moov;

	let trak_count = moov.containers(TRAK).count();
	if trak_count != 1 {
		return Err(Error::TrakCount(trak_count));
	}

	let trexes: Vec<Trex> = match moov.find_container(MVEX) {
		Some(mvex) => mvex
			.children
			.iter()
			.filter_map(|child| match child {
				MediaBox::Raw(raw) if raw.kind == Trex::KIND => Some(decode_raw::<Trex>(raw)),
				_ => None,
			})
			.collect::<Result<_>>()?,
		None => Vec::new(),
	};

	let mut table = TrackTable::new();

	for trak in moov.containers_mut(TRAK) {
		let track_id = track_id(trak)?;
		let trex = trexes
			.iter()
			.find(|trex| trex.track_id == track_id)
			.or_else(|| trexes.first())
			.copied()
			.unwrap_or_default();

		let stbl = trak.child_mut(MDIA)?.child_mut(MINF)?.child_mut(STBL)?;

		let stsd = stbl
			.children
			.iter_mut()
			.find_map(|child| match child {
				MediaBox::Stsd(stsd) => Some(stsd),
				_ => None,
			})
			.ok_or(Error::MissingBox {
				parent: STBL,
				child: STSD,
			})?;

		// Restore protected entries to their original format.
		let mut crypto = None;
		for entry in &mut stsd.entries {
			if entry.kind != ENCA && entry.kind != ENCV {
				continue;
			}

			let (restored, schm, tenc) = strip_protection(entry, track_id)?;
			if schm.scheme_type != CBCS {
				return Err(Error::Scheme(schm.scheme_type));
			}
			*entry = restored;

			if crypto.is_none() {
				crypto = Some(TrackCrypto {
					scheme: schm.scheme_type,
					tenc,
				});
			}
		}

		// Collapse dual entries.
		match stsd.entries.len() {
			1 => {}
			2 => {
				if stsd.entries[0].kind != stsd.entries[1].kind {
					return Err(Error::StsdMismatch(stsd.entries[0].kind, stsd.entries[1].kind));
				}
				stsd.entries.truncate(1);
			}
			count => return Err(Error::UnexpectedStsd(count)),
		}

		stbl.remove_children(|child| match child {
			MediaBox::Raw(raw) => {
				matches!(raw.grouping_type(), Some(grouping) if grouping == SEAM || grouping == SEIG)
			}
			_ => false,
		});

		if let Some(crypto) = &crypto {
			debug!(
				track_id,
				key_id = %hex::encode(crypto.tenc.key_id),
				crypt = crypto.tenc.crypt_byte_block,
				skip = crypto.tenc.skip_byte_block,
				"track decryption descriptor"
			);
		}

		table.insert(track_id, TrackInfo { trex, crypto });
	}

	moov.remove_children(|child| child.kind() == PSSH);

	Ok(table)
}

fn track_id(trak: &Container) -> Result<u32> {
	let tkhd = trak.find_raw(TKHD).ok_or(Error::MissingBox {
		parent: TRAK,
		child: TKHD,
	})?;

	let payload = tkhd.payload();
	let version = *payload.first().ok_or(Error::TruncatedBox)?;
	// version/flags, then creation and modification times.
	let offset = 4 + if version == 1 { 16 } else { 8 };

	let bytes: [u8; 4] = payload
		.get(offset..offset + 4)
		.ok_or(Error::TruncatedBox)?
		.try_into()
		.expect("slice length checked");
	Ok(u32::from_be_bytes(bytes))
}

/// Rewrite an `enca`/`encv` entry: fourcc restored from `frma`, `sinf`
/// dropped, everything else carried verbatim.
fn strip_protection(entry: &RawBox, track_id: u32) -> Result<(RawBox, Schm, Tenc)> {
	let prefix_len = if entry.kind == ENCA {
		AUDIO_ENTRY_PREFIX
	} else {
		VISUAL_ENTRY_PREFIX
	};

	let payload = entry.payload();
	if payload.len() < prefix_len {
		return Err(Error::TruncatedBox);
	}

	let mut kept = BytesMut::new();
	let mut sinf = None;
	for (kind, header_len, data) in split_boxes(payload.slice(prefix_len..))? {
		if kind == SINF && sinf.is_none() {
			sinf = Some(parse_container(kind, header_len, data)?);
		} else {
			kept.put_slice(&data);
		}
	}
	let sinf = sinf.ok_or(Error::MissingSinf(entry.kind))?;

	let frma: Frma = decode_raw(sinf.find_raw(Frma::KIND).ok_or(Error::MissingBox {
		parent: SINF,
		child: Frma::KIND,
	})?)?;
	let schm: Schm = decode_raw(sinf.find_raw(Schm::KIND).ok_or(Error::MissingBox {
		parent: SINF,
		child: Schm::KIND,
	})?)?;
	let tenc: Tenc = decode_raw(
		sinf.child(SCHI)?
			.find_raw(Tenc::KIND)
			.ok_or(Error::MissingTenc(track_id))?,
	)?;

	let total = 8 + prefix_len + kept.len();
	let mut data = BytesMut::with_capacity(total);
	data.put_u32(total as u32);
	frma.data_format.encode(&mut data).map_err(Error::BoxParse)?;
	data.put_slice(&payload[..prefix_len]);
	data.put_slice(&kept);

	Ok((
		RawBox {
			kind: frma.data_format,
			header_len: 8,
			data: data.freeze(),
		},
		schm,
		tenc,
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::boxes::{FTYP, MOOV};

	pub fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
		let mut out = Vec::new();
		out.put_u32((8 + payload.len()) as u32);
		out.extend_from_slice(kind);
		out.extend_from_slice(payload);
		out
	}

	fn atom_bytes<T: Atom>(atom: &T) -> Vec<u8> {
		let mut buf = BytesMut::new();
		atom.encode(&mut buf).unwrap();
		buf.to_vec()
	}

	pub fn tkhd(track_id: u32) -> Vec<u8> {
		let mut payload = vec![0u8; 8 + 4];
		payload.extend_from_slice(&track_id.to_be_bytes());
		payload.extend_from_slice(&[0; 60]);
		boxed(b"tkhd", &payload[..4 + 8 + 4 + 60])
	}

	pub fn sample_tenc(crypt: u8, skip: u8) -> Tenc {
		Tenc {
			crypt_byte_block: crypt,
			skip_byte_block: skip,
			is_protected: 1,
			per_sample_iv_size: 0,
			key_id: [0x42; 16],
			constant_iv: Some(vec![0x24; 16]),
		}
	}

	pub fn enca(scheme: &[u8; 4], tenc: &Tenc) -> Vec<u8> {
		let frma = atom_bytes(&Frma {
			data_format: FourCC::new(b"mp4a"),
		});
		let schm = atom_bytes(&Schm {
			scheme_type: FourCC::new(scheme),
			scheme_version: 0x10000,
		});
		let schi = boxed(b"schi", &atom_bytes(tenc));

		let mut sinf = Vec::new();
		sinf.extend_from_slice(&frma);
		sinf.extend_from_slice(&schm);
		sinf.extend_from_slice(&schi);
		let sinf = boxed(b"sinf", &sinf);

		// Fixed audio sample-entry fields, then an esds stand-in and the sinf.
		let mut payload = vec![0u8; AUDIO_ENTRY_PREFIX];
		payload.extend_from_slice(&boxed(b"esds", &[0; 16]));
		payload.extend_from_slice(&sinf);
		boxed(b"enca", &payload)
	}

	pub fn stsd(entries: &[Vec<u8>]) -> Vec<u8> {
		let mut payload = Vec::new();
		payload.put_u32(0);
		payload.put_u32(entries.len() as u32);
		for entry in entries {
			payload.extend_from_slice(entry);
		}
		boxed(b"stsd", &payload)
	}

	pub fn sbgp(grouping: &[u8; 4]) -> Vec<u8> {
		let mut payload = Vec::new();
		payload.extend_from_slice(&[0; 4]);
		payload.extend_from_slice(grouping);
		payload.extend_from_slice(&[0; 8]);
		boxed(b"sbgp", &payload)
	}

	pub fn trex_bytes(track_id: u32, duration: u32, size: u32) -> Vec<u8> {
		atom_bytes(&Trex {
			track_id,
			default_sample_description_index: 1,
			default_sample_duration: duration,
			default_sample_size: size,
			default_sample_flags: 0,
		})
	}

	pub fn build_init(stsd_entries: &[Vec<u8>], extra_stbl: &[Vec<u8>], track_id: u32) -> Init {
		let mut stbl = stsd(stsd_entries);
		for extra in extra_stbl {
			stbl.extend_from_slice(extra);
		}
		let stbl = boxed(b"stbl", &stbl);
		let minf = boxed(b"minf", &stbl);
		let mdia = boxed(b"mdia", &minf);

		let mut trak = tkhd(track_id);
		trak.extend_from_slice(&mdia);
		let trak = boxed(b"trak", &trak);

		let mvex = boxed(b"mvex", &trex_bytes(track_id, 1024, 0));

		let mut moov = trak;
		moov.extend_from_slice(&mvex);
		let moov = boxed(b"moov", &moov);

		Init {
			ftyp: RawBox::new(FTYP, b"M4A \x00\x00\x00\x00"),
			moov: parse_container(MOOV, 8, bytes::Bytes::from(moov)).unwrap(),
		}
	}

	#[test]
	fn transform_builds_table_and_restores_entry() {
		let tenc = sample_tenc(1, 0);
		let mut init = build_init(&[enca(b"cbcs", &tenc)], &[sbgp(b"seig"), sbgp(b"roll")], 1);

		let table = transform(&mut init).unwrap();
		let info = table.get(&1).unwrap();
		assert_eq!(info.trex.default_sample_duration, 1024);
		let crypto = info.crypto.as_ref().unwrap();
		assert_eq!(crypto.tenc, tenc);

		// Entry restored to its original fourcc, sinf gone.
		let trak = init.moov.find_container(TRAK).unwrap();
		let stbl = trak.child(MDIA).unwrap().child(MINF).unwrap().child(STBL).unwrap();
		let stsd = stbl
			.children
			.iter()
			.find_map(|child| match child {
				MediaBox::Stsd(stsd) => Some(stsd),
				_ => None,
			})
			.unwrap();
		assert_eq!(stsd.entries.len(), 1);
		assert_eq!(stsd.entries[0].kind, FourCC::new(b"mp4a"));
		assert!(!contains_fourcc(&stsd.entries[0].data, b"sinf"));

		// seig grouping stripped, unrelated grouping kept.
		let groupings: Vec<_> = stbl
			.children
			.iter()
			.filter_map(|child| match child {
				MediaBox::Raw(raw) => raw.grouping_type(),
				_ => None,
			})
			.collect();
		assert_eq!(groupings, vec![FourCC::new(b"roll")]);
	}

	#[test]
	fn transform_collapses_twin_entries() {
		let tenc = sample_tenc(1, 0);
		let twin = enca(b"cbcs", &tenc);
		let mut init = build_init(&[twin.clone(), twin], &[], 1);

		transform(&mut init).unwrap();

		let trak = init.moov.find_container(TRAK).unwrap();
		let stbl = trak.child(MDIA).unwrap().child(MINF).unwrap().child(STBL).unwrap();
		let stsd = stbl
			.children
			.iter()
			.find_map(|child| match child {
				MediaBox::Stsd(stsd) => Some(stsd),
				_ => None,
			})
			.unwrap();
		assert_eq!(stsd.entries.len(), 1);
	}

	#[test]
	fn transform_rejects_wrong_scheme() {
		let tenc = sample_tenc(1, 0);
		let mut init = build_init(&[enca(b"cenc", &tenc)], &[], 1);
		assert!(matches!(transform(&mut init), Err(Error::Scheme(_))));
	}

	#[test]
	fn transform_rejects_mismatched_twins() {
		let tenc = sample_tenc(1, 0);
		let other = boxed(b"alac", &[0; 32]);
		let mut init = build_init(&[enca(b"cbcs", &tenc), other], &[], 1);
		assert!(matches!(transform(&mut init), Err(Error::StsdMismatch(..))));
	}

	#[test]
	fn transform_rejects_overfull_stsd() {
		let entry = boxed(b"mp4a", &[0; 32]);
		let mut init = build_init(&[entry.clone(), entry.clone(), entry], &[], 1);
		assert!(matches!(transform(&mut init), Err(Error::UnexpectedStsd(3))));
	}

	fn contains_fourcc(data: &[u8], needle: &[u8; 4]) -> bool {
		data.windows(4).any(|window| window == needle)
	}
}
