//! Key-delivery session client.
//!
//! The key service speaks a tiny length-prefixed protocol over plain TCP:
//!
//! - SendString: one length byte, then that many UTF-8 bytes.
//! - SwitchKeys: four zero bytes, between segment handshakes.
//! - Terminate: five zero bytes, then close.
//! - DecryptBlock: little-endian u32 count, that many ciphertext bytes; the
//!   server answers with exactly the same number of plaintext bytes.
//!
//! The session is strictly ordered; the next request must not start until the
//! previous response has been read in full. It is owned by exactly one
//! decrypt loop.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

use crate::playlist::SegmentKey;
use crate::{Error, Result};

pub struct KeySession {
	stream: BufStream<TcpStream>,
}

impl KeySession {
	pub async fn connect(addr: &str) -> Result<Self> {
		let stream = TcpStream::connect(addr).await.map_err(Error::KeyService)?;
		debug!(addr, "key session connected");
		Ok(Self {
			stream: BufStream::new(stream),
		})
	}

	/// Per-segment key setup. `first` is true only for the run's first
	/// segment, which does not get a leading SwitchKeys.
	pub async fn handshake(&mut self, asset_id: &str, key: &SegmentKey, first: bool) -> Result<()> {
		if !first {
			self.switch_keys().await?;
		}
		if key.is_prefetch() {
			self.send_string("0").await?;
		} else {
			self.send_string(asset_id).await?;
		}
		self.send_string(&key.uri).await
	}

	pub async fn send_string(&mut self, value: &str) -> Result<()> {
		debug_assert!(value.len() <= u8::MAX as usize, "protocol strings are length-prefixed by one byte");
		self.write(&[value.len() as u8]).await?;
		self.write(value.as_bytes()).await
	}

	pub async fn switch_keys(&mut self) -> Result<()> {
		self.write(&[0; 4]).await
	}

	/// Send the terminal frame and close the connection.
	pub async fn terminate(mut self) -> Result<()> {
		self.write(&[0; 5]).await?;
		self.flush().await
	}

	/// Start a DecryptBlock frame of `len` ciphertext bytes.
	pub(crate) async fn begin_block(&mut self, len: u32) -> Result<()> {
		debug_assert_eq!(len % 16, 0, "DecryptBlock length must be a multiple of 16");
		self.write(&len.to_le_bytes()).await
	}

	pub(crate) async fn send_ciphertext(&mut self, data: &[u8]) -> Result<()> {
		self.write(data).await
	}

	pub(crate) async fn flush(&mut self) -> Result<()> {
		self.stream.flush().await.map_err(Error::KeyService)
	}

	pub(crate) async fn recv_plaintext(&mut self, buf: &mut [u8]) -> Result<()> {
		self.stream.read_exact(buf).await.map_err(|err| match err.kind() {
			std::io::ErrorKind::UnexpectedEof => Error::KeyTruncated,
			_ => Error::KeyService(err),
		})?;
		Ok(())
	}

	async fn write(&mut self, data: &[u8]) -> Result<()> {
		self.stream.write_all(data).await.map_err(Error::KeyService)
	}
}

/// Ask the resolver service for the media playlist URL of an asset.
///
/// Same SendString framing on the request side; the reply is one
/// newline-terminated URL.
pub async fn resolve_playlist_url(addr: &str, asset_id: &str) -> Result<String> {
	let stream = TcpStream::connect(addr).await.map_err(Error::KeyService)?;
	let mut stream = BufStream::new(stream);

	stream
		.write_all(&[asset_id.len() as u8])
		.await
		.map_err(Error::KeyService)?;
	stream.write_all(asset_id.as_bytes()).await.map_err(Error::KeyService)?;
	stream.flush().await.map_err(Error::KeyService)?;

	let mut line = Vec::new();
	stream.read_until(b'\n', &mut line).await.map_err(Error::KeyService)?;

	let url = String::from_utf8_lossy(&line).trim().to_string();
	if url.is_empty() {
		return Err(Error::EmptyResolverReply);
	}
	Ok(url)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::playlist::PREFETCH_KEY_URI;
	use tokio::net::TcpListener;

	/// Accepts one connection and returns every byte received until close.
	async fn capture_server() -> (String, tokio::task::JoinHandle<Vec<u8>>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();

		let handle = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut bytes = Vec::new();
			socket.read_to_end(&mut bytes).await.unwrap();
			bytes
		});

		(addr, handle)
	}

	#[tokio::test]
	async fn handshake_wire_order() {
		let (addr, capture) = capture_server().await;

		let mut session = KeySession::connect(&addr).await.unwrap();
		let prefetch = SegmentKey {
			uri: PREFETCH_KEY_URI.to_string(),
			iv: None,
		};
		let keyed = SegmentKey {
			uri: "skd://itunes.apple.com/track/42".to_string(),
			iv: None,
		};

		session.handshake("1446002478", &prefetch, true).await.unwrap();
		session.handshake("1446002478", &keyed, false).await.unwrap();
		session.terminate().await.unwrap();

		let bytes = capture.await.unwrap();

		let mut expected = Vec::new();
		// Segment 0: no SwitchKeys, prefetch sends "0".
		expected.push(1);
		expected.extend_from_slice(b"0");
		expected.push(PREFETCH_KEY_URI.len() as u8);
		expected.extend_from_slice(PREFETCH_KEY_URI.as_bytes());
		// Segment 1: SwitchKeys, then asset id and key uri.
		expected.extend_from_slice(&[0, 0, 0, 0]);
		expected.push(10);
		expected.extend_from_slice(b"1446002478");
		expected.push(keyed.uri.len() as u8);
		expected.extend_from_slice(keyed.uri.as_bytes());
		// Terminate.
		expected.extend_from_slice(&[0, 0, 0, 0, 0]);

		assert_eq!(bytes, expected);
	}

	#[tokio::test]
	async fn decrypt_block_round_trip() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();

		// Echo server: answers each DecryptBlock with the payload XOR 0x55.
		let server = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut len = [0u8; 4];
			socket.read_exact(&mut len).await.unwrap();
			let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
			socket.read_exact(&mut data).await.unwrap();
			for byte in &mut data {
				*byte ^= 0x55;
			}
			socket.write_all(&data).await.unwrap();
		});

		let mut session = KeySession::connect(&addr).await.unwrap();
		let mut data = [0xAAu8; 16];

		session.begin_block(16).await.unwrap();
		session.send_ciphertext(&data).await.unwrap();
		session.flush().await.unwrap();
		session.recv_plaintext(&mut data).await.unwrap();

		assert_eq!(data, [0xFFu8; 16]);
		server.await.unwrap();
	}

	#[tokio::test]
	async fn truncated_response_is_a_crypto_error() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();

		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut len = [0u8; 4];
			socket.read_exact(&mut len).await.unwrap();
			let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
			socket.read_exact(&mut data).await.unwrap();
			// Answer with fewer bytes than requested, then close.
			socket.write_all(&data[..8]).await.unwrap();
		});

		let mut session = KeySession::connect(&addr).await.unwrap();
		let mut data = [0u8; 16];
		session.begin_block(16).await.unwrap();
		session.send_ciphertext(&data).await.unwrap();
		session.flush().await.unwrap();

		let err = session.recv_plaintext(&mut data).await.unwrap_err();
		assert!(matches!(err, Error::KeyTruncated));
	}
}
