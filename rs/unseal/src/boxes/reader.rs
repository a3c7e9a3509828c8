//! Pull-based box reader over a [ByteSource].
//!
//! Yields the init (`ftyp` + `moov`) first, then fragments (`moof` + `mdat`,
//! with any `emsg`/`prft` riding along). Buffers at most one box ahead.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use mp4_atom::{DecodeMaybe, FourCC, Header};

use super::graph::{self, Container, RawBox};
use crate::source::ByteSource;
use crate::{Error, Result};

pub struct BoxReader<S: ByteSource> {
	source: S,
	buffer: BytesMut,
	offset: u64,
}

/// The `ftyp` + `moov` prelude.
#[derive(Debug, Clone)]
pub struct Init {
	pub ftyp: RawBox,
	pub moov: Container,
}

impl Init {
	pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
		buf.extend_from_slice(&self.ftyp.data);
		self.moov.encode(buf)
	}
}

/// One `moof` + `mdat` pair, plus any auxiliary boxes read before the `moof`.
#[derive(Debug, Clone)]
pub struct Fragment {
	pub aux: Vec<RawBox>,
	pub moof: Container,
	/// Encoded size of the moof as read, before any rewrite.
	pub moof_size: usize,
	pub mdat_header: Bytes,
	/// The mdat payload, mutable so samples can be decrypted in place.
	pub mdat: BytesMut,
}

impl Fragment {
	pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
		for aux in &self.aux {
			buf.extend_from_slice(&aux.data);
		}
		self.moof.encode(buf)?;
		buf.extend_from_slice(&self.mdat_header);
		buf.extend_from_slice(&self.mdat);
		Ok(())
	}
}

impl<S: ByteSource> BoxReader<S> {
	pub fn new(source: S) -> Self {
		Self {
			source,
			buffer: BytesMut::new(),
			offset: 0,
		}
	}

	/// Bytes fully consumed from the stream so far.
	pub fn offset(&self) -> u64 {
		self.offset
	}

	/// Read the init segment: exactly `ftyp` then `moov`.
	pub async fn read_init(&mut self) -> Result<Init> {
		let (kind, header_len, data) = self.next_raw().await?.ok_or(Error::TruncatedBox)?;
		if kind != graph::FTYP {
			return Err(Error::BadInit(kind));
		}
		let ftyp = RawBox { kind, header_len, data };

		let (kind, header_len, data) = self.next_raw().await?.ok_or(Error::TruncatedBox)?;
		if kind != graph::MOOV {
			return Err(Error::BadInit(kind));
		}
		let moov = graph::parse_container(kind, header_len, data)?;

		Ok(Init { ftyp, moov })
	}

	/// Read the next fragment, or `None` at end of stream.
	///
	/// Trailing data with an `mdat` but no `moof` also yields `None`; the
	/// streaming producer is allowed to pad the tail.
	pub async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
		let mut aux = Vec::new();
		let mut moof: Option<(Container, usize)> = None;

		loop {
			let Some((kind, header_len, data)) = self.next_raw().await? else {
				return Ok(None);
			};

			match kind {
				graph::MOOF => {
					if moof.is_some() {
						return Err(Error::DuplicateMoof);
					}
					let size = data.len();
					moof = Some((graph::parse_container(kind, header_len, data)?, size));
				}
				graph::EMSG | graph::PRFT => {
					aux.push(RawBox { kind, header_len, data });
				}
				graph::MDAT => {
					let Some((moof, moof_size)) = moof else {
						return Ok(None);
					};
					return Ok(Some(Fragment {
						aux,
						moof,
						moof_size,
						mdat_header: data.slice(..header_len),
						mdat: BytesMut::from(&data[header_len..]),
					}));
				}
				// sidx and friends are irrelevant between fragments.
				_ => {}
			}
		}
	}

	/// Next full atom: `(kind, header_len, full bytes)`. `None` at clean EOF.
	async fn next_raw(&mut self) -> Result<Option<(FourCC, usize, Bytes)>> {
		loop {
			if !self.buffer.is_empty() {
				let mut cursor = Cursor::new(&self.buffer[..]);
				if let Some(header) = Header::decode_maybe(&mut cursor)? {
					let header_len = cursor.position() as usize;
					let size = header.size.ok_or(Error::TruncatedBox)?;
					let total = header_len + size;

					if self.buffer.len() >= total {
						let data = self.buffer.split_to(total).freeze();
						self.offset += total as u64;
						return Ok(Some((header.kind, header_len, data)));
					}
				}
			}

			// Need more data.
			let read = self.source.read_buf(&mut self.buffer).await?;
			if read == 0 {
				if self.buffer.is_empty() {
					return Ok(None);
				}
				return Err(Error::TruncatedBox);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::MemorySource;
	use bytes::BufMut;

	fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
		let mut out = Vec::new();
		out.put_u32((8 + payload.len()) as u32);
		out.extend_from_slice(kind);
		out.extend_from_slice(payload);
		out
	}

	fn reader(bytes: Vec<u8>) -> BoxReader<MemorySource> {
		BoxReader::new(MemorySource::new(bytes.into()))
	}

	#[tokio::test]
	async fn init_requires_ftyp_then_moov() {
		let mut stream = boxed(b"ftyp", b"isom");
		stream.extend(boxed(b"moov", &boxed(b"mvhd", &[0; 20])));

		let mut reader = reader(stream);
		let init = reader.read_init().await.unwrap();
		assert_eq!(init.ftyp.kind, graph::FTYP);
		assert!(init.moov.find_raw(FourCC::new(b"mvhd")).is_some());
	}

	#[tokio::test]
	async fn init_rejects_other_head() {
		let stream = boxed(b"free", b"");
		let mut reader = reader(stream);
		assert!(matches!(reader.read_init().await, Err(Error::BadInit(_))));
	}

	#[tokio::test]
	async fn fragment_assembles_moof_and_mdat() {
		let mut stream = boxed(b"emsg", &[0; 4]);
		stream.extend(boxed(b"moof", &boxed(b"mfhd", &[0; 8])));
		stream.extend(boxed(b"mdat", b"payload"));

		let mut reader = reader(stream);
		let frag = reader.next_fragment().await.unwrap().unwrap();
		assert_eq!(frag.aux.len(), 1);
		assert_eq!(&frag.mdat[..], b"payload");
		assert_eq!(frag.moof_size, 8 + 16);

		assert!(reader.next_fragment().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn mdat_without_moof_is_end_of_stream() {
		let stream = boxed(b"mdat", b"junk");
		let mut reader = reader(stream);
		assert!(reader.next_fragment().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn eof_inside_a_box_is_an_error() {
		let mut stream = boxed(b"moof", &boxed(b"mfhd", &[0; 8]));
		stream.truncate(stream.len() - 3);

		let mut reader = reader(stream);
		assert!(matches!(reader.next_fragment().await, Err(Error::TruncatedBox)));
	}

	#[tokio::test]
	async fn fragment_round_trips() {
		let mut stream = boxed(b"moof", &boxed(b"mfhd", &[0; 8]));
		stream.extend(boxed(b"mdat", b"data!"));

		let mut reader = reader(stream.clone());
		let frag = reader.next_fragment().await.unwrap().unwrap();

		let mut out = BytesMut::new();
		frag.encode(&mut out).unwrap();
		assert_eq!(&out[..], &stream[..]);
	}
}
