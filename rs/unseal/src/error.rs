use mp4_atom::FourCC;

/// The failure taxonomy; every [Error] variant maps onto exactly one category.
///
/// Transport errors are retried close to the socket (see [crate::download]);
/// everything else aborts the current attempt immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
	Transport,
	Protocol,
	Container,
	Crypto,
	Sequencing,
	Resource,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	// Transport
	#[error("http: {0}")]
	Http(#[from] reqwest::Error),

	#[error("key service i/o: {0}")]
	KeyService(std::io::Error),

	#[error("media read: {0}")]
	MediaRead(std::io::Error),

	// Protocol
	#[error("failed to parse media playlist: {0}")]
	PlaylistParse(String),

	#[error("playlist is not a media playlist")]
	PlaylistNotMedia,

	#[error("playlist contains no segments")]
	NoSegments,

	#[error("segment {0} is missing a byte-range")]
	NonByterangePlaylist(usize),

	#[error("segment {index} starts at {start}, expected {expected}")]
	GappedRanges { index: usize, start: u64, expected: u64 },

	#[error("could not determine media size")]
	SizeUnknown,

	#[error("server answered {0} to a ranged request")]
	BadRangeStatus(reqwest::StatusCode),

	#[error("resolver returned an empty playlist url")]
	EmptyResolverReply,

	#[error("bad url: {0}")]
	Url(#[from] url::ParseError),

	// Container
	#[error("box parse: {0}")]
	BoxParse(#[from] mp4_atom::Error),

	#[error("unexpected box {0:?} at the head, expected ftyp then moov")]
	BadInit(FourCC),

	#[error("media stream truncated inside a box")]
	TruncatedBox,

	#[error("init holds {0} traks, expected exactly 1")]
	TrakCount(usize),

	#[error("stsd holds {0} entries, expected 1 or 2")]
	UnexpectedStsd(usize),

	#[error("stsd entries differ in type: {0:?} vs {1:?}")]
	StsdMismatch(FourCC, FourCC),

	#[error("sample at {offset}+{size} lands outside the mdat ({mdat} bytes)")]
	SampleOutOfBounds { offset: usize, size: usize, mdat: usize },

	#[error("trun data offset {0} points before the end of the moof")]
	BadDataOffset(i32),

	#[error("{parent:?} is missing a {child:?} box")]
	MissingBox { parent: FourCC, child: FourCC },

	#[error("two moof boxes without an mdat between them")]
	DuplicateMoof,

	// Crypto
	#[error("scheme {0:?} not supported, only cbcs")]
	Scheme(FourCC),

	#[error("protected entry {0:?} has no sinf")]
	MissingSinf(FourCC),

	#[error("track {0} sinf carries no tenc")]
	MissingTenc(u32),

	#[error("traf for track {0} has no senc")]
	MissingSenc(u32),

	#[error("no decryption info for track {0}")]
	UnknownTrack(u32),

	#[error("senc describes {senc} samples, trun describes {trun}")]
	SencCount { senc: usize, trun: usize },

	#[error("key service closed mid-response")]
	KeyTruncated,

	// Sequencing
	#[error("fragment {0} has no matching playlist segment")]
	SegmentsExhausted(usize),

	// Resource
	#[error("no accounts configured")]
	NoAccounts,

	#[error("scratch file: {0}")]
	Scratch(std::io::Error),

	#[error("output file: {0}")]
	Output(std::io::Error),

	#[error("all {attempts} account attempts failed")]
	Exhausted {
		attempts: usize,
		#[source]
		last: Box<Error>,
	},
}

impl Error {
	pub fn category(&self) -> Category {
		match self {
			Error::Http(_) | Error::KeyService(_) | Error::MediaRead(_) => Category::Transport,

			Error::PlaylistParse(_)
			| Error::PlaylistNotMedia
			| Error::NoSegments
			| Error::NonByterangePlaylist(_)
			| Error::GappedRanges { .. }
			| Error::SizeUnknown
			| Error::BadRangeStatus(_)
			| Error::EmptyResolverReply
			| Error::Url(_) => Category::Protocol,

			Error::BoxParse(_)
			| Error::BadInit(_)
			| Error::TruncatedBox
			| Error::TrakCount(_)
			| Error::UnexpectedStsd(_)
			| Error::StsdMismatch(..)
			| Error::SampleOutOfBounds { .. }
			| Error::BadDataOffset(_)
			| Error::MissingBox { .. }
			| Error::DuplicateMoof => Category::Container,

			Error::Scheme(_)
			| Error::MissingSinf(_)
			| Error::MissingTenc(_)
			| Error::MissingSenc(_)
			| Error::UnknownTrack(_)
			| Error::SencCount { .. }
			| Error::KeyTruncated => Category::Crypto,

			Error::SegmentsExhausted(_) => Category::Sequencing,

			Error::NoAccounts | Error::Scratch(_) | Error::Output(_) => Category::Resource,

			Error::Exhausted { last, .. } => last.category(),
		}
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
