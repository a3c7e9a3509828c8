//! Pattern-aware CBCS sample decryption.
//!
//! The key service is the crypto oracle: ciphertext goes out in DecryptBlock
//! frames, plaintext of the same length comes back, and this module only
//! decides which bytes of each sample are part of the frame. Samples are
//! decrypted in place, in `trun` order.

use mp4_atom::Atom;
use tracing::trace;

use crate::boxes::{Container, Fragment, MediaBox, Senc, SubSample, TRAF, Tfhd, Trex, decode_raw};
use crate::init::TrackTable;
use crate::keys::KeySession;
use crate::{Error, Result};

/// A sample with its defaults resolved through trun entry, tfhd, then trex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullSample {
	/// Offset into the mdat payload.
	pub offset: usize,
	pub size: usize,
	pub duration: u32,
	pub flags: u32,
}

/// Resolve every sample of a traf against the mdat payload.
///
/// `trun.data_offset` is relative to the start of the moof, so the moof and
/// mdat header sizes are subtracted to land inside the payload.
pub fn full_samples(
	traf: &Container,
	tfhd: &Tfhd,
	trex: &Trex,
	moof_size: usize,
	mdat_header: usize,
	mdat_len: usize,
) -> Result<Vec<FullSample>> {
	let base = tfhd.base_data_offset.unwrap_or(0) as usize;
	let mut offset = base;
	let mut samples = Vec::new();

	for trun in traf.children.iter().filter_map(|child| match child {
		MediaBox::Trun(trun) => Some(trun),
		_ => None,
	}) {
		if let Some(data_offset) = trun.data_offset {
			let relative = usize::try_from(data_offset).map_err(|_| Error::BadDataOffset(data_offset))?;
			if relative < moof_size + mdat_header {
				return Err(Error::BadDataOffset(data_offset));
			}
			offset = base + relative - moof_size - mdat_header;
		}

		for entry in &trun.entries {
			let size = entry
				.size
				.unwrap_or(tfhd.default_sample_size.unwrap_or(trex.default_sample_size)) as usize;
			let duration = entry
				.duration
				.unwrap_or(tfhd.default_sample_duration.unwrap_or(trex.default_sample_duration));
			let flags = entry
				.flags
				.unwrap_or(tfhd.default_sample_flags.unwrap_or(trex.default_sample_flags));

			if offset + size > mdat_len {
				return Err(Error::SampleOutOfBounds {
					offset,
					size,
					mdat: mdat_len,
				});
			}

			samples.push(FullSample {
				offset,
				size,
				duration,
				flags,
			});
			offset += size;
		}
	}

	Ok(samples)
}

/// Decrypt every sample of every traf in the fragment, in place.
pub async fn decrypt_fragment(frag: &mut Fragment, tracks: &TrackTable, session: &mut KeySession) -> Result<()> {
	let moof = &frag.moof;
	let mdat = &mut frag.mdat;
	let mdat_header = frag.mdat_header.len();
	let mdat_len = mdat.len();

	for traf in moof.containers(TRAF) {
		let tfhd: Tfhd = decode_raw(traf.find_raw(Tfhd::KIND).ok_or(Error::MissingBox {
			parent: TRAF,
			child: Tfhd::KIND,
		})?)?;
		let track_id = tfhd.track_id;

		let info = tracks.get(&track_id).ok_or(Error::UnknownTrack(track_id))?;
		let Some(crypto) = &info.crypto else {
			// Clear track; nothing to do.
			continue;
		};

		let senc = find_senc(traf, crypto.tenc.per_sample_iv_size).ok_or(Error::MissingSenc(track_id))??;

		let samples = full_samples(traf, &tfhd, &info.trex, frag.moof_size, mdat_header, mdat_len)?;
		if senc.samples.len() != samples.len() {
			return Err(Error::SencCount {
				senc: senc.samples.len(),
				trun: samples.len(),
			});
		}

		let crypt_len = crypto.tenc.crypt_byte_block as usize * 16;
		let skip_len = crypto.tenc.skip_byte_block as usize * 16;

		let total_duration: u64 = samples.iter().map(|sample| sample.duration as u64).sum();
		trace!(track_id, samples = samples.len(), total_duration, "decrypting traf");

		for (sample, senc_sample) in samples.iter().zip(&senc.samples) {
			let data = &mut mdat[sample.offset..sample.offset + sample.size];
			decrypt_sample(data, &senc_sample.sub_samples, crypt_len, skip_len, session).await?;
		}
	}

	Ok(())
}

fn find_senc(traf: &Container, iv_size: u8) -> Option<Result<Senc>> {
	for child in &traf.children {
		let MediaBox::Raw(raw) = child else { continue };

		if raw.kind == Senc::KIND {
			let payload = raw.payload();
			let mut cursor = std::io::Cursor::new(&payload[..]);
			return Some(Senc::parse(&mut cursor, iv_size, false).map_err(Error::BoxParse));
		}
		if raw.is_uuid_senc() {
			let payload = raw.payload().slice(16..);
			let mut cursor = std::io::Cursor::new(&payload[..]);
			return Some(Senc::parse(&mut cursor, iv_size, true).map_err(Error::BoxParse));
		}
	}
	None
}

/// Decrypt one sample: walk the sub-sample map, or treat the whole sample as
/// a single protected region when there is none.
async fn decrypt_sample(
	data: &mut [u8],
	sub_samples: &[SubSample],
	crypt_len: usize,
	skip_len: usize,
	session: &mut KeySession,
) -> Result<()> {
	if sub_samples.is_empty() {
		return decrypt_region(data, crypt_len, skip_len, session).await;
	}

	let mut pos = 0usize;
	for sub in sub_samples {
		pos += sub.clear_bytes as usize;
		if sub.protected_bytes == 0 {
			continue;
		}

		let end = pos + sub.protected_bytes as usize;
		if end > data.len() {
			return Err(Error::SampleOutOfBounds {
				offset: pos,
				size: sub.protected_bytes as usize,
				mdat: data.len(),
			});
		}

		decrypt_region(&mut data[pos..end], crypt_len, skip_len, session).await?;
		pos = end;
	}

	Ok(())
}

async fn decrypt_region(data: &mut [u8], crypt_len: usize, skip_len: usize, session: &mut KeySession) -> Result<()> {
	if skip_len == 0 {
		decrypt_full_region(data, session).await
	} else {
		decrypt_striped_region(data, crypt_len, skip_len, session).await
	}
}

/// Full-subsample mode: the region is encrypted up to its last full 16-byte
/// block; the short tail stays clear.
async fn decrypt_full_region(data: &mut [u8], session: &mut KeySession) -> Result<()> {
	let len = data.len() & !0xf;
	if len == 0 {
		return Ok(());
	}

	session.begin_block(len as u32).await?;
	session.send_ciphertext(&data[..len]).await?;
	session.flush().await?;
	session.recv_plaintext(&mut data[..len]).await
}

/// Stripe mode: a repeating pattern of `crypt_len` encrypted then `skip_len`
/// clear bytes. Only the encrypted stripes travel to the oracle, as one
/// gathered frame, and the plaintext is scattered back over the same
/// positions.
async fn decrypt_striped_region(
	data: &mut [u8],
	crypt_len: usize,
	skip_len: usize,
	session: &mut KeySession,
) -> Result<()> {
	let size = data.len();
	if size < crypt_len {
		return Ok(());
	}

	let count = ((size - crypt_len) / (crypt_len + skip_len)) + 1;
	session.begin_block((count * crypt_len) as u32).await?;

	let mut pos = 0;
	loop {
		if size - pos < crypt_len {
			break;
		}
		session.send_ciphertext(&data[pos..pos + crypt_len]).await?;
		pos += crypt_len;
		if size - pos < skip_len {
			break;
		}
		pos += skip_len;
	}
	session.flush().await?;

	let mut pos = 0;
	loop {
		if size - pos < crypt_len {
			break;
		}
		session.recv_plaintext(&mut data[pos..pos + crypt_len]).await?;
		pos += crypt_len;
		if size - pos < skip_len {
			break;
		}
		pos += skip_len;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	/// Oracle that answers every DecryptBlock with the payload XOR 0x55.
	async fn xor_oracle() -> String {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();

		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			loop {
				let mut len = [0u8; 4];
				if socket.read_exact(&mut len).await.is_err() {
					return;
				}
				let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
				if socket.read_exact(&mut data).await.is_err() {
					return;
				}
				for byte in &mut data {
					*byte ^= 0x55;
				}
				if socket.write_all(&data).await.is_err() {
					return;
				}
			}
		});

		addr
	}

	#[tokio::test]
	async fn full_subsample_leaves_clear_lead_and_tail() {
		let addr = xor_oracle().await;
		let mut session = KeySession::connect(&addr).await.unwrap();

		// 4 clear bytes, then 18 protected: 16 through the oracle, 2 left.
		let mut data = Vec::new();
		data.extend_from_slice(&[0u8; 4]);
		data.extend_from_slice(&[0xAAu8; 18]);

		let subs = [SubSample {
			clear_bytes: 4,
			protected_bytes: 18,
		}];
		decrypt_sample(&mut data, &subs, 16, 0, &mut session).await.unwrap();

		assert_eq!(&data[..4], &[0u8; 4]);
		assert_eq!(&data[4..20], &[0xFFu8; 16]);
		assert_eq!(&data[20..], &[0xAAu8; 2]);
	}

	#[tokio::test]
	async fn short_protected_region_passes_through() {
		let addr = xor_oracle().await;
		let mut session = KeySession::connect(&addr).await.unwrap();

		let mut data = [0xAAu8; 15];
		let subs = [SubSample {
			clear_bytes: 0,
			protected_bytes: 15,
		}];
		decrypt_sample(&mut data, &subs, 16, 0, &mut session).await.unwrap();
		assert_eq!(data, [0xAAu8; 15]);
	}

	#[tokio::test]
	async fn stripe_pattern_one_nine() {
		let addr = xor_oracle().await;
		let mut session = KeySession::connect(&addr).await.unwrap();

		// crypt 16, skip 144; region of 176 bytes. count = ((176-16)/160)+1 = 2,
		// so bytes [0, 16) and [160, 176) go through the oracle.
		let mut data = [0xAAu8; 176];
		decrypt_region(&mut data, 16, 144, &mut session).await.unwrap();

		assert_eq!(&data[..16], &[0xFFu8; 16]);
		assert_eq!(&data[16..160], &[0xAAu8; 144]);
		assert_eq!(&data[160..], &[0xFFu8; 16]);
	}

	#[tokio::test]
	async fn stripe_shorter_than_crypt_block_passes_through() {
		let addr = xor_oracle().await;
		let mut session = KeySession::connect(&addr).await.unwrap();

		let mut data = [0xAAu8; 15];
		decrypt_region(&mut data, 16, 144, &mut session).await.unwrap();
		assert_eq!(data, [0xAAu8; 15]);
	}

	#[tokio::test]
	async fn whole_sample_without_map_is_one_region() {
		let addr = xor_oracle().await;
		let mut session = KeySession::connect(&addr).await.unwrap();

		let mut data = [0xAAu8; 32];
		decrypt_sample(&mut data, &[], 16, 0, &mut session).await.unwrap();
		assert_eq!(data, [0xFFu8; 32]);
	}
}
