//! Typed atoms the container crate does not model.
//!
//! Each type implements [mp4_atom::Atom] so it can be decoded from and
//! encoded to the wire with the same machinery as the built-in atoms. Only
//! the fields this pipeline consumes are interpreted; everything else in the
//! surrounding tree is carried as raw bytes.

use mp4_atom::{Atom, Buf, BufMut, Decode, Encode, FourCC, Result};

/// OriginalFormatBox; names the sample-entry fourcc before protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frma {
	pub data_format: FourCC,
}

impl Atom for Frma {
	const KIND: FourCC = FourCC::new(b"frma");

	fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
		Ok(Self {
			data_format: FourCC::decode(buf)?,
		})
	}

	fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		self.data_format.encode(buf)
	}
}

/// SchemeTypeBox; identifies the protection scheme (`cbcs` expected).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schm {
	pub scheme_type: FourCC,
	pub scheme_version: u32,
}

impl Atom for Schm {
	const KIND: FourCC = FourCC::new(b"schm");

	fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
		let ext = u32::decode(buf)?;
		let scheme_type = FourCC::decode(buf)?;
		let scheme_version = u32::decode(buf)?;
		if ext & 1 == 1 {
			// Browser URI present; nothing downstream reads it.
			let _ = String::decode(buf)?;
		}
		Ok(Self {
			scheme_type,
			scheme_version,
		})
	}

	fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		0u32.encode(buf)?;
		self.scheme_type.encode(buf)?;
		self.scheme_version.encode(buf)
	}
}

/// TrackEncryptionBox; the per-track decryption defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenc {
	pub crypt_byte_block: u8,
	pub skip_byte_block: u8,
	pub is_protected: u8,
	pub per_sample_iv_size: u8,
	pub key_id: [u8; 16],
	pub constant_iv: Option<Vec<u8>>,
}

impl Atom for Tenc {
	const KIND: FourCC = FourCC::new(b"tenc");

	fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
		let ext = u32::decode(buf)?;
		let version = ext >> 24;

		u8::decode(buf)?; // reserved
		let (crypt_byte_block, skip_byte_block) = if version == 0 {
			u8::decode(buf)?; // reserved
			(0, 0)
		} else {
			let blocks = u8::decode(buf)?;
			(blocks >> 4, blocks & 0b1111)
		};

		let is_protected = u8::decode(buf)?;
		let per_sample_iv_size = u8::decode(buf)?;
		let key_id = <[u8; 16]>::decode(buf)?;

		let constant_iv = if is_protected == 1 && per_sample_iv_size == 0 {
			let size = u8::decode(buf)? as usize;
			if buf.remaining() < size {
				return Err(mp4_atom::Error::OutOfBounds);
			}
			let mut iv = vec![0u8; size];
			iv.copy_from_slice(buf.slice(size));
			buf.advance(size);
			Some(iv)
		} else {
			None
		};

		Ok(Self {
			crypt_byte_block,
			skip_byte_block,
			is_protected,
			per_sample_iv_size,
			key_id,
			constant_iv,
		})
	}

	fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		let version: u32 = if self.crypt_byte_block != 0 || self.skip_byte_block != 0 {
			1
		} else {
			0
		};
		(version << 24).encode(buf)?;

		0u8.encode(buf)?;
		if version == 0 {
			0u8.encode(buf)?;
		} else {
			((self.crypt_byte_block << 4) | (self.skip_byte_block & 0b1111)).encode(buf)?;
		}
		self.is_protected.encode(buf)?;
		self.per_sample_iv_size.encode(buf)?;
		self.key_id.encode(buf)?;

		if let Some(iv) = &self.constant_iv {
			(iv.len() as u8).encode(buf)?;
			for byte in iv {
				byte.encode(buf)?;
			}
		}
		Ok(())
	}
}

/// TrackExtendsBox; fragment-wide sample defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trex {
	pub track_id: u32,
	pub default_sample_description_index: u32,
	pub default_sample_duration: u32,
	pub default_sample_size: u32,
	pub default_sample_flags: u32,
}

impl Atom for Trex {
	const KIND: FourCC = FourCC::new(b"trex");

	fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
		u32::decode(buf)?; // version/flags
		Ok(Self {
			track_id: u32::decode(buf)?,
			default_sample_description_index: u32::decode(buf)?,
			default_sample_duration: u32::decode(buf)?,
			default_sample_size: u32::decode(buf)?,
			default_sample_flags: u32::decode(buf)?,
		})
	}

	fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		0u32.encode(buf)?;
		self.track_id.encode(buf)?;
		self.default_sample_description_index.encode(buf)?;
		self.default_sample_duration.encode(buf)?;
		self.default_sample_size.encode(buf)?;
		self.default_sample_flags.encode(buf)
	}
}

/// TrackFragmentHeaderBox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tfhd {
	pub track_id: u32,
	pub base_data_offset: Option<u64>,
	pub sample_description_index: Option<u32>,
	pub default_sample_duration: Option<u32>,
	pub default_sample_size: Option<u32>,
	pub default_sample_flags: Option<u32>,
	pub duration_is_empty: bool,
	pub default_base_is_moof: bool,
}

impl Tfhd {
	const BASE_DATA_OFFSET: u32 = 0x000001;
	const SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
	const DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
	const DEFAULT_SAMPLE_SIZE: u32 = 0x000010;
	const DEFAULT_SAMPLE_FLAGS: u32 = 0x000020;
	const DURATION_IS_EMPTY: u32 = 0x010000;
	const DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

	fn flags(&self) -> u32 {
		let mut flags = 0;
		flags |= self.base_data_offset.map_or(0, |_| Self::BASE_DATA_OFFSET);
		flags |= self.sample_description_index.map_or(0, |_| Self::SAMPLE_DESCRIPTION_INDEX);
		flags |= self.default_sample_duration.map_or(0, |_| Self::DEFAULT_SAMPLE_DURATION);
		flags |= self.default_sample_size.map_or(0, |_| Self::DEFAULT_SAMPLE_SIZE);
		flags |= self.default_sample_flags.map_or(0, |_| Self::DEFAULT_SAMPLE_FLAGS);
		if self.duration_is_empty {
			flags |= Self::DURATION_IS_EMPTY;
		}
		if self.default_base_is_moof {
			flags |= Self::DEFAULT_BASE_IS_MOOF;
		}
		flags
	}
}

impl Atom for Tfhd {
	const KIND: FourCC = FourCC::new(b"tfhd");

	fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
		let flags = u32::decode(buf)? & 0x00ff_ffff;
		let track_id = u32::decode(buf)?;

		let base_data_offset = (flags & Self::BASE_DATA_OFFSET != 0)
			.then(|| u64::decode(buf))
			.transpose()?;
		let sample_description_index = (flags & Self::SAMPLE_DESCRIPTION_INDEX != 0)
			.then(|| u32::decode(buf))
			.transpose()?;
		let default_sample_duration = (flags & Self::DEFAULT_SAMPLE_DURATION != 0)
			.then(|| u32::decode(buf))
			.transpose()?;
		let default_sample_size = (flags & Self::DEFAULT_SAMPLE_SIZE != 0)
			.then(|| u32::decode(buf))
			.transpose()?;
		let default_sample_flags = (flags & Self::DEFAULT_SAMPLE_FLAGS != 0)
			.then(|| u32::decode(buf))
			.transpose()?;

		Ok(Self {
			track_id,
			base_data_offset,
			sample_description_index,
			default_sample_duration,
			default_sample_size,
			default_sample_flags,
			duration_is_empty: flags & Self::DURATION_IS_EMPTY != 0,
			default_base_is_moof: flags & Self::DEFAULT_BASE_IS_MOOF != 0,
		})
	}

	fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		self.flags().encode(buf)?;
		self.track_id.encode(buf)?;

		if let Some(offset) = self.base_data_offset {
			offset.encode(buf)?;
		}
		if let Some(index) = self.sample_description_index {
			index.encode(buf)?;
		}
		if let Some(duration) = self.default_sample_duration {
			duration.encode(buf)?;
		}
		if let Some(size) = self.default_sample_size {
			size.encode(buf)?;
		}
		if let Some(flags) = self.default_sample_flags {
			flags.encode(buf)?;
		}
		Ok(())
	}
}

/// TrackRunBox; the only fragment box this pipeline mutates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trun {
	pub version: u8,
	pub data_offset: Option<i32>,
	pub first_sample_flags: Option<u32>,
	pub entries: Vec<TrunEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunEntry {
	pub duration: Option<u32>,
	pub size: Option<u32>,
	pub flags: Option<u32>,
	pub cts: Option<i32>,
}

impl Trun {
	const DATA_OFFSET: u32 = 0x000001;
	const FIRST_SAMPLE_FLAGS: u32 = 0x000004;
	const SAMPLE_DURATION: u32 = 0x000100;
	const SAMPLE_SIZE: u32 = 0x000200;
	const SAMPLE_FLAGS: u32 = 0x000400;
	const SAMPLE_CTS: u32 = 0x000800;

	fn flags(&self) -> u32 {
		let mut flags = 0;
		flags |= self.data_offset.map_or(0, |_| Self::DATA_OFFSET);
		flags |= self.first_sample_flags.map_or(0, |_| Self::FIRST_SAMPLE_FLAGS);
		if let Some(first) = self.entries.first() {
			flags |= first.duration.map_or(0, |_| Self::SAMPLE_DURATION);
			flags |= first.size.map_or(0, |_| Self::SAMPLE_SIZE);
			flags |= first.flags.map_or(0, |_| Self::SAMPLE_FLAGS);
			flags |= first.cts.map_or(0, |_| Self::SAMPLE_CTS);
		}
		flags
	}
}

impl Atom for Trun {
	const KIND: FourCC = FourCC::new(b"trun");

	fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
		let ext = u32::decode(buf)?;
		let version = (ext >> 24) as u8;
		let flags = ext & 0x00ff_ffff;

		let count = u32::decode(buf)? as usize;
		if count > buf.remaining() {
			// Each entry takes at least one byte per enabled field; a count
			// beyond the remaining payload is corrupt.
			return Err(mp4_atom::Error::OutOfBounds);
		}

		let data_offset = (flags & Self::DATA_OFFSET != 0)
			.then(|| u32::decode(buf).map(|v| v as i32))
			.transpose()?;
		let first_sample_flags = (flags & Self::FIRST_SAMPLE_FLAGS != 0)
			.then(|| u32::decode(buf))
			.transpose()?;

		let mut entries = Vec::with_capacity(count);
		for _ in 0..count {
			entries.push(TrunEntry {
				duration: (flags & Self::SAMPLE_DURATION != 0).then(|| u32::decode(buf)).transpose()?,
				size: (flags & Self::SAMPLE_SIZE != 0).then(|| u32::decode(buf)).transpose()?,
				flags: (flags & Self::SAMPLE_FLAGS != 0).then(|| u32::decode(buf)).transpose()?,
				cts: (flags & Self::SAMPLE_CTS != 0)
					.then(|| u32::decode(buf).map(|v| v as i32))
					.transpose()?,
			});
		}

		Ok(Self {
			version,
			data_offset,
			first_sample_flags,
			entries,
		})
	}

	fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		(((self.version as u32) << 24) | self.flags()).encode(buf)?;
		(self.entries.len() as u32).encode(buf)?;

		if let Some(offset) = self.data_offset {
			(offset as u32).encode(buf)?;
		}
		if let Some(flags) = self.first_sample_flags {
			flags.encode(buf)?;
		}
		for entry in &self.entries {
			if let Some(duration) = entry.duration {
				duration.encode(buf)?;
			}
			if let Some(size) = entry.size {
				size.encode(buf)?;
			}
			if let Some(flags) = entry.flags {
				flags.encode(buf)?;
			}
			if let Some(cts) = entry.cts {
				(cts as u32).encode(buf)?;
			}
		}
		Ok(())
	}
}

/// Extended type of the PIFF flavour of the sample-encryption box.
pub const UUID_SENC: [u8; 16] = [
	0xa2, 0x39, 0x4f, 0x52, 0x5a, 0x9b, 0x4f, 0x14, 0xa2, 0x44, 0x6c, 0x42, 0x7c, 0x64, 0x8d, 0xf4,
];

/// SampleEncryptionBox contents.
///
/// `senc` cannot be decoded context-free: the per-sample IV size comes from
/// the track's `tenc`, so the box is carried raw and parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Senc {
	pub samples: Vec<SencSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SencSample {
	pub iv: Vec<u8>,
	pub sub_samples: Vec<SubSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSample {
	pub clear_bytes: u16,
	pub protected_bytes: u32,
}

impl Senc {
	pub const KIND: FourCC = FourCC::new(b"senc");
	const SUB_SAMPLES: u32 = 0x000002;
	const PIFF_OVERRIDE: u32 = 0x000001;

	/// Parse a `senc` payload (or a PIFF UUID payload with the extended type
	/// already stripped) using the track's per-sample IV size.
	pub fn parse<B: Buf>(buf: &mut B, per_sample_iv_size: u8, piff: bool) -> Result<Self> {
		let ext = u32::decode(buf)?;
		let flags = ext & 0x00ff_ffff;

		if piff && flags & Self::PIFF_OVERRIDE != 0 {
			// Algorithm id (24 bits), IV size, key id override.
			if buf.remaining() < 20 {
				return Err(mp4_atom::Error::OutOfBounds);
			}
			buf.advance(20);
		}

		let count = u32::decode(buf)? as usize;
		if count > buf.remaining() {
			return Err(mp4_atom::Error::OutOfBounds);
		}

		let mut samples = Vec::with_capacity(count);
		for _ in 0..count {
			let iv_size = per_sample_iv_size as usize;
			if buf.remaining() < iv_size {
				return Err(mp4_atom::Error::OutOfBounds);
			}
			let mut iv = vec![0u8; iv_size];
			iv.copy_from_slice(buf.slice(iv_size));
			buf.advance(iv_size);

			let sub_samples = if flags & Self::SUB_SAMPLES != 0 {
				let entries = u16::decode(buf)? as usize;
				if entries * 6 > buf.remaining() {
					return Err(mp4_atom::Error::OutOfBounds);
				}
				let mut subs = Vec::with_capacity(entries);
				for _ in 0..entries {
					subs.push(SubSample {
						clear_bytes: u16::decode(buf)?,
						protected_bytes: u32::decode(buf)?,
					});
				}
				subs
			} else {
				Vec::new()
			};

			samples.push(SencSample { iv, sub_samples });
		}

		Ok(Self { samples })
	}

	/// Encode back to a plain `senc` payload. Used to build fixtures; the
	/// pipeline itself only ever removes this box.
	pub fn encode_payload<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		let has_subs = self.samples.iter().any(|sample| !sample.sub_samples.is_empty());
		let flags = if has_subs { Self::SUB_SAMPLES } else { 0 };
		flags.encode(buf)?;
		(self.samples.len() as u32).encode(buf)?;

		for sample in &self.samples {
			for byte in &sample.iv {
				byte.encode(buf)?;
			}
			if has_subs {
				(sample.sub_samples.len() as u16).encode(buf)?;
				for sub in &sample.sub_samples {
					sub.clear_bytes.encode(buf)?;
					sub.protected_bytes.encode(buf)?;
				}
			}
		}
		Ok(())
	}
}
