//! An owned ISO-BMFF box tree built for rewriting.
//!
//! Boxes the pipeline never interprets are kept as raw leaves carrying their
//! original bytes, so anything we do not understand round-trips untouched.
//! Containers own their children; the handful of boxes we mutate (`stsd`,
//! `trun`) are typed leaves.

use std::io::Cursor;

use bytes::{BufMut, Bytes, BytesMut};
use mp4_atom::{Atom, Decode, DecodeMaybe, Encode, FourCC, Header};

use super::atoms::{Trun, UUID_SENC};
use crate::{Error, Result};

pub const FTYP: FourCC = FourCC::new(b"ftyp");
pub const MOOV: FourCC = FourCC::new(b"moov");
pub const TRAK: FourCC = FourCC::new(b"trak");
pub const TKHD: FourCC = FourCC::new(b"tkhd");
pub const MDIA: FourCC = FourCC::new(b"mdia");
pub const MINF: FourCC = FourCC::new(b"minf");
pub const STBL: FourCC = FourCC::new(b"stbl");
pub const STSD: FourCC = FourCC::new(b"stsd");
pub const MVEX: FourCC = FourCC::new(b"mvex");
pub const MOOF: FourCC = FourCC::new(b"moof");
pub const TRAF: FourCC = FourCC::new(b"traf");
pub const MDAT: FourCC = FourCC::new(b"mdat");
pub const SINF: FourCC = FourCC::new(b"sinf");
pub const SCHI: FourCC = FourCC::new(b"schi");
pub const EMSG: FourCC = FourCC::new(b"emsg");
pub const PRFT: FourCC = FourCC::new(b"prft");
pub const SAIZ: FourCC = FourCC::new(b"saiz");
pub const SAIO: FourCC = FourCC::new(b"saio");
pub const SBGP: FourCC = FourCC::new(b"sbgp");
pub const SGPD: FourCC = FourCC::new(b"sgpd");
pub const PSSH: FourCC = FourCC::new(b"pssh");
pub const UUID: FourCC = FourCC::new(b"uuid");
pub const ENCA: FourCC = FourCC::new(b"enca");
pub const ENCV: FourCC = FourCC::new(b"encv");

pub const SEAM: FourCC = FourCC::new(b"seam");
pub const SEIG: FourCC = FourCC::new(b"seig");

const HEADER_LEN: usize = 8;

/// Containers we descend into; everything else stays opaque.
fn is_container(kind: FourCC) -> bool {
	matches!(kind, MOOV | TRAK | MDIA | MINF | STBL | MVEX | MOOF | TRAF | SINF | SCHI)
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaBox {
	Container(Container),
	Stsd(Stsd),
	Trun(Trun),
	Raw(RawBox),
}

impl MediaBox {
	pub fn kind(&self) -> FourCC {
		match self {
			MediaBox::Container(container) => container.kind,
			MediaBox::Stsd(_) => STSD,
			MediaBox::Trun(_) => Trun::KIND,
			MediaBox::Raw(raw) => raw.kind,
		}
	}

	/// Encoded size in bytes, header included.
	pub fn size(&self) -> usize {
		match self {
			MediaBox::Container(container) => container.size(),
			MediaBox::Stsd(stsd) => stsd.size(),
			MediaBox::Trun(trun) => HEADER_LEN + trun_body_size(trun),
			MediaBox::Raw(raw) => raw.data.len(),
		}
	}

	pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
		match self {
			MediaBox::Container(container) => container.encode(buf),
			MediaBox::Stsd(stsd) => stsd.encode(buf),
			MediaBox::Trun(trun) => trun.encode(buf).map_err(Error::BoxParse),
			MediaBox::Raw(raw) => {
				buf.put_slice(&raw.data);
				Ok(())
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
	pub kind: FourCC,
	pub children: Vec<MediaBox>,
}

impl Container {
	pub fn size(&self) -> usize {
		HEADER_LEN + self.children.iter().map(MediaBox::size).sum::<usize>()
	}

	pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
		let mut body = BytesMut::new();
		for child in &self.children {
			child.encode(&mut body)?;
		}

		buf.put_u32((HEADER_LEN + body.len()) as u32);
		self.kind.encode(buf).map_err(Error::BoxParse)?;
		buf.put_slice(&body);
		Ok(())
	}

	pub fn find(&self, kind: FourCC) -> Option<&MediaBox> {
		self.children.iter().find(|child| child.kind() == kind)
	}

	pub fn find_container(&self, kind: FourCC) -> Option<&Container> {
		self.children.iter().find_map(|child| match child {
			MediaBox::Container(container) if container.kind == kind => Some(container),
			_ => None,
		})
	}

	pub fn find_container_mut(&mut self, kind: FourCC) -> Option<&mut Container> {
		self.children.iter_mut().find_map(|child| match child {
			MediaBox::Container(container) if container.kind == kind => Some(container),
			_ => None,
		})
	}

	pub fn find_raw(&self, kind: FourCC) -> Option<&RawBox> {
		self.children.iter().find_map(|child| match child {
			MediaBox::Raw(raw) if raw.kind == kind => Some(raw),
			_ => None,
		})
	}

	pub fn containers(&self, kind: FourCC) -> impl Iterator<Item = &Container> {
		self.children.iter().filter_map(move |child| match child {
			MediaBox::Container(container) if container.kind == kind => Some(container),
			_ => None,
		})
	}

	pub fn containers_mut(&mut self, kind: FourCC) -> impl Iterator<Item = &mut Container> {
		self.children.iter_mut().filter_map(move |child| match child {
			MediaBox::Container(container) if container.kind == kind => Some(container),
			_ => None,
		})
	}

	/// Navigate to a required child container.
	pub fn child(&self, kind: FourCC) -> Result<&Container> {
		self.find_container(kind).ok_or(Error::MissingBox {
			parent: self.kind,
			child: kind,
		})
	}

	pub fn child_mut(&mut self, kind: FourCC) -> Result<&mut Container> {
		let parent = self.kind;
		self.find_container_mut(kind)
			.ok_or(Error::MissingBox { parent, child: kind })
	}

	/// Drop every child matching the predicate, returning the bytes removed.
	pub fn remove_children<F>(&mut self, mut pred: F) -> u64
	where
		F: FnMut(&MediaBox) -> bool,
	{
		let mut removed = 0u64;
		self.children.retain(|child| {
			if pred(child) {
				removed += child.size() as u64;
				false
			} else {
				true
			}
		});
		removed
	}
}

/// An opaque leaf: the full original atom bytes, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBox {
	pub kind: FourCC,
	pub header_len: usize,
	pub data: Bytes,
}

impl RawBox {
	/// Build a raw box from a payload, synthesizing a 32-bit header.
	pub fn new(kind: FourCC, payload: &[u8]) -> Self {
		let mut data = BytesMut::with_capacity(HEADER_LEN + payload.len());
		data.put_u32((HEADER_LEN + payload.len()) as u32);
		kind.encode(&mut data).expect("fourcc encode is infallible");
		data.put_slice(payload);

		Self {
			kind,
			header_len: HEADER_LEN,
			data: data.freeze(),
		}
	}

	pub fn payload(&self) -> Bytes {
		self.data.slice(self.header_len..)
	}

	/// Grouping type of an `sbgp`/`sgpd` payload.
	pub fn grouping_type(&self) -> Option<FourCC> {
		if self.kind != SBGP && self.kind != SGPD {
			return None;
		}
		let payload = self.payload();
		let bytes: [u8; 4] = payload.get(4..8)?.try_into().ok()?;
		Some(FourCC::new(&bytes))
	}

	/// Whether this is the PIFF UUID flavour of the sample-encryption box.
	pub fn is_uuid_senc(&self) -> bool {
		self.kind == UUID && self.payload().starts_with(&UUID_SENC)
	}
}

/// Split a byte region into `(kind, header_len, full atom bytes)` triples.
pub fn split_boxes(data: Bytes) -> Result<Vec<(FourCC, usize, Bytes)>> {
	let mut rest = data;
	let mut out = Vec::new();

	while !rest.is_empty() {
		let mut cursor = Cursor::new(&rest[..]);
		let header = Header::decode_maybe(&mut cursor)?.ok_or(Error::TruncatedBox)?;
		let header_len = cursor.position() as usize;
		let size = header.size.ok_or(Error::TruncatedBox)?;
		let total = header_len + size;
		if total > rest.len() {
			return Err(Error::TruncatedBox);
		}

		let atom = rest.split_to(total);
		out.push((header.kind, header_len, atom));
	}

	Ok(out)
}

/// Parse one atom (full bytes, header included) into the tree.
pub fn parse_box(kind: FourCC, header_len: usize, data: Bytes) -> Result<MediaBox> {
	if is_container(kind) {
		let mut children = Vec::new();
		for (child_kind, child_header, child_data) in split_boxes(data.slice(header_len..))? {
			children.push(parse_box(child_kind, child_header, child_data)?);
		}
		return Ok(MediaBox::Container(Container { kind, children }));
	}

	if kind == STSD {
		return Stsd::parse(data.slice(header_len..)).map(MediaBox::Stsd);
	}

	if kind == Trun::KIND {
		let mut cursor = Cursor::new(&data[header_len..]);
		let trun = Trun::decode_body(&mut cursor)?;
		return Ok(MediaBox::Trun(trun));
	}

	Ok(MediaBox::Raw(RawBox { kind, header_len, data }))
}

/// Decode a typed view of a raw leaf's payload.
pub fn decode_raw<T: Atom>(raw: &RawBox) -> Result<T> {
	let payload = raw.payload();
	let mut cursor = Cursor::new(&payload[..]);
	T::decode_body(&mut cursor).map_err(Error::BoxParse)
}

/// Parse a container atom, erroring on anything else.
pub fn parse_container(kind: FourCC, header_len: usize, data: Bytes) -> Result<Container> {
	match parse_box(kind, header_len, data)? {
		MediaBox::Container(container) => Ok(container),
		other => Err(Error::BadInit(other.kind())),
	}
}

/// SampleDescriptionBox: a full box whose children are sample entries.
///
/// Kept typed because sanitization rewrites the entry list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stsd {
	pub entries: Vec<RawBox>,
}

impl Stsd {
	fn parse(payload: Bytes) -> Result<Self> {
		let mut cursor = Cursor::new(&payload[..]);
		let _ext = u32::decode(&mut cursor)?;
		let count = u32::decode(&mut cursor)? as usize;

		let mut entries = Vec::with_capacity(count);
		for (kind, header_len, data) in split_boxes(payload.slice(cursor.position() as usize..))? {
			entries.push(RawBox { kind, header_len, data });
		}

		if entries.len() != count {
			return Err(Error::BoxParse(mp4_atom::Error::InvalidSize));
		}
		Ok(Self { entries })
	}

	pub fn size(&self) -> usize {
		HEADER_LEN + 8 + self.entries.iter().map(|entry| entry.data.len()).sum::<usize>()
	}

	pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
		buf.put_u32(self.size() as u32);
		STSD.encode(buf).map_err(Error::BoxParse)?;
		buf.put_u32(0); // version + flags
		buf.put_u32(self.entries.len() as u32);
		for entry in &self.entries {
			buf.put_slice(&entry.data);
		}
		Ok(())
	}
}

fn trun_body_size(trun: &Trun) -> usize {
	let mut size = 8; // version/flags + sample count
	if trun.data_offset.is_some() {
		size += 4;
	}
	if trun.first_sample_flags.is_some() {
		size += 4;
	}
	if let Some(first) = trun.entries.first() {
		let per_entry = [
			first.duration.is_some(),
			first.size.is_some(),
			first.flags.is_some(),
			first.cts.is_some(),
		]
		.iter()
		.filter(|present| **present)
		.count() * 4;
		size += per_entry * trun.entries.len();
	}
	size
}

#[cfg(test)]
mod tests {
	use super::*;

	fn leaf(kind: &[u8; 4], payload: &[u8]) -> RawBox {
		RawBox::new(FourCC::new(kind), payload)
	}

	#[test]
	fn raw_round_trips_byte_identical() {
		let raw = leaf(b"free", b"abcdef");
		let parsed = parse_box(raw.kind, raw.header_len, raw.data.clone()).unwrap();

		let mut buf = BytesMut::new();
		parsed.encode(&mut buf).unwrap();
		assert_eq!(&buf[..], &raw.data[..]);
	}

	#[test]
	fn container_parses_and_reencodes() {
		// Build bottom-up: stbl(stts), minf(stbl), mdia(minf), trak(mdia), moov(trak).
		let mut bytes = leaf(b"stts", &[0; 8]).data;
		for kind in [b"stbl", b"minf", b"mdia", b"trak", b"moov"] {
			let mut wrapped = BytesMut::new();
			wrapped.put_u32((HEADER_LEN + bytes.len()) as u32);
			wrapped.put_slice(&kind[..]);
			wrapped.put_slice(&bytes);
			bytes = wrapped.freeze();
		}

		let parsed = parse_container(MOOV, HEADER_LEN, bytes.clone()).unwrap();
		assert_eq!(parsed.kind, MOOV);

		let stbl = parsed
			.child(TRAK)
			.and_then(|trak| trak.child(MDIA))
			.and_then(|mdia| mdia.child(MINF))
			.and_then(|minf| minf.child(STBL))
			.unwrap();
		assert!(stbl.find_raw(FourCC::new(b"stts")).is_some());

		let mut out = BytesMut::new();
		parsed.encode(&mut out).unwrap();
		assert_eq!(&out[..], &bytes[..]);
	}

	#[test]
	fn remove_children_accounts_bytes() {
		let mut container = Container {
			kind: TRAF,
			children: vec![
				MediaBox::Raw(leaf(b"senc", &[0; 72])),
				MediaBox::Raw(leaf(b"saiz", &[0; 32])),
				MediaBox::Raw(leaf(b"tfdt", &[0; 8])),
			],
		};

		let removed = container.remove_children(|child| child.kind() == FourCC::new(b"senc"));
		assert_eq!(removed, 80);
		assert_eq!(container.children.len(), 2);
	}

	#[test]
	fn grouping_type_reads_sbgp() {
		let mut payload = Vec::new();
		payload.extend_from_slice(&[0; 4]); // version/flags
		payload.extend_from_slice(b"seig");
		payload.extend_from_slice(&[0; 8]);
		let sbgp = leaf(b"sbgp", &payload);
		assert_eq!(sbgp.grouping_type(), Some(SEIG));

		let other = leaf(b"stts", &payload);
		assert_eq!(other.grouping_type(), None);
	}

	#[test]
	fn split_boxes_rejects_truncation() {
		let raw = leaf(b"free", b"abcdef");
		let truncated = raw.data.slice(..raw.data.len() - 2);
		assert!(matches!(split_boxes(truncated), Err(Error::TruncatedBox)));
	}
}
