//! Chunk URI parsing.
//!
//! A chunk URI looks like
//! `/videos/media/ts/9277/13/720/3ae5aa5839690b8d9ea9fcef9b720fb4_00028.ts`
//! and splits into exactly eight `/`-separated segments. Field offsets are
//! fixed; nothing beyond the split is allocated.

/// Offsets into the split chunk path. The first four segments are
/// `["", "videos", "media", "ts"]`.
pub const CHUNK_TITLE_ID: usize = 4;
pub const CHUNK_SERIE_ID: usize = 5;
pub const CHUNK_QUALITY: usize = 6;
pub const CHUNK_FILENAME: usize = 7;

const CHUNK_SEGMENTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TitleQuality {
    Sd,
    Hd,
    Fhd,
}

impl TitleQuality {
    pub fn from_folder(folder: &str) -> Option<Self> {
        match folder {
            "480" => Some(TitleQuality::Sd),
            "720" => Some(TitleQuality::Hd),
            "1080" => Some(TitleQuality::Fhd),
            _ => None,
        }
    }

    /// The path segment this quality lives under.
    pub fn folder(self) -> &'static str {
        match self {
            TitleQuality::Sd => "480",
            TitleQuality::Hd => "720",
            TitleQuality::Fhd => "1080",
        }
    }
}

impl std::fmt::Display for TitleQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.folder())
    }
}

/// A chunk request parsed from a client-supplied URI. Borrows the path.
#[derive(Debug, Clone)]
pub struct ChunkRequest<'a> {
    raw: Vec<&'a str>,
}

impl<'a> ChunkRequest<'a> {
    pub fn parse(path: &'a str) -> Self {
        Self {
            raw: path.split('/').collect(),
        }
    }

    /// Valid means eight segments and a recognized quality folder.
    pub fn is_valid(&self) -> bool {
        self.raw.len() == CHUNK_SEGMENTS && self.quality().is_some()
    }

    pub fn title_id(&self) -> u16 {
        self.raw[CHUNK_TITLE_ID].parse().unwrap_or(0)
    }

    pub fn title_id_str(&self) -> &'a str {
        self.raw[CHUNK_TITLE_ID]
    }

    pub fn serie_id(&self) -> u16 {
        self.raw[CHUNK_SERIE_ID].parse().unwrap_or(0)
    }

    pub fn serie_id_str(&self) -> &'a str {
        self.raw[CHUNK_SERIE_ID]
    }

    pub fn quality(&self) -> Option<TitleQuality> {
        TitleQuality::from_folder(self.raw[CHUNK_QUALITY])
    }

    pub fn quality_folder(&self) -> &'a str {
        self.raw[CHUNK_QUALITY]
    }

    pub fn filename(&self) -> &'a str {
        self.raw[CHUNK_FILENAME]
    }

    /// Content hash embedded in the filename, if any.
    pub fn content_hash(&self) -> Option<&'a str> {
        hash_from_filename(self.filename())
    }

    pub fn is_playlist(&self) -> bool {
        self.filename().ends_with(".m3u8")
    }

    /// Older chunk naming (`fffNNNNN.ts`) shares one hash across qualities.
    pub fn is_legacy_format(&self) -> bool {
        self.filename().contains("fff")
    }
}

/// Extracts the content hash from a chunk filename.
///
/// `<hash>_NNNNN.ts` and `<hash>.ts` yield `<hash>`; `<hash>.m3u8` yields
/// `<hash>`; anything else carries no hash.
pub fn hash_from_filename(filename: &str) -> Option<&str> {
    match filename.as_bytes().last().copied() {
        Some(b's') if filename.contains(".ts") => {
            let head = filename.split(".ts").next()?;
            Some(head.split('_').next().unwrap_or(head))
        }
        Some(b'8') if filename.contains(".m3u8") => filename.split(".m3u8").next(),
        _ => None,
    }
}
