//! Cache key types shared by the metadata and image stores.

use std::fmt;

/// Media extensions the upstream actually serves; anything else is rejected
/// before a filesystem path is ever formed.
const ALLOWED_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".gif", ".webm", ".pdf"];

const MAX_BOARD_LEN: usize = 16;

/// Kind of upstream JSON document held in the metadata cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Boards,
    Catalog,
    Thread,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Boards => "boards",
            ResourceKind::Catalog => "catalog",
            ResourceKind::Thread => "thread",
        }
    }
}

/// Identity of a metadata cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Boards,
    Catalog { board: String },
    Thread { board: String, no: u64 },
}

impl MetaKey {
    pub fn boards() -> Self {
        MetaKey::Boards
    }

    pub fn catalog(board: impl Into<String>) -> Self {
        MetaKey::Catalog {
            board: board.into(),
        }
    }

    pub fn thread(board: impl Into<String>, no: u64) -> Self {
        MetaKey::Thread {
            board: board.into(),
            no,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            MetaKey::Boards => ResourceKind::Boards,
            MetaKey::Catalog { .. } => ResourceKind::Catalog,
            MetaKey::Thread { .. } => ResourceKind::Thread,
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaKey::Boards => write!(f, "boards"),
            MetaKey::Catalog { board } => write!(f, "catalog/{board}"),
            MetaKey::Thread { board, no } => write!(f, "thread/{board}/{no}"),
        }
    }
}

/// Storage tier of a cached image. Thumbnails are long-lived; full images
/// are the evictable tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageVariant {
    Thumb,
    Full,
}

impl ImageVariant {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ImageVariant::Thumb => "thumbs",
            ImageVariant::Full => "full",
        }
    }
}

/// Identity of a cached image file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub board: String,
    pub tim: u64,
    pub ext: String,
    pub variant: ImageVariant,
}

impl ImageKey {
    pub fn thumb(board: impl Into<String>, tim: u64) -> Self {
        Self {
            board: board.into(),
            tim,
            ext: ".jpg".to_string(),
            variant: ImageVariant::Thumb,
        }
    }

    pub fn full(board: impl Into<String>, tim: u64, ext: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            tim,
            ext: ext.into(),
            variant: ImageVariant::Full,
        }
    }

    /// On-disk file name. Thumbnails carry the upstream `s.jpg` suffix so a
    /// directory scan can reconstruct the variant.
    pub fn file_name(&self) -> String {
        match self.variant {
            ImageVariant::Thumb => format!("{}s.jpg", self.tim),
            ImageVariant::Full => format!("{}{}", self.tim, self.ext),
        }
    }

    /// Path relative to the cache root: `<tier>/<board>/<file>`.
    pub fn rel_path(&self) -> String {
        format!("{}/{}/{}", self.variant.dir_name(), self.board, self.file_name())
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.board, self.file_name())
    }
}

/// Validate a board slug before it participates in any path or URL.
pub fn is_valid_board(board: &str) -> bool {
    !board.is_empty()
        && board.len() <= MAX_BOARD_LEN
        && board.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// Parse a requested image file name (`{tim}s.jpg` for thumbnails,
/// `{tim}{ext}` otherwise) into an [`ImageKey`].
pub fn parse_image_name(board: &str, name: &str) -> Option<ImageKey> {
    if !is_valid_board(board) {
        return None;
    }

    if let Some(stem) = name.strip_suffix("s.jpg") {
        if let Ok(tim) = stem.parse::<u64>() {
            return Some(ImageKey::thumb(board, tim));
        }
    }

    let dot = name.find('.')?;
    let (stem, ext) = name.split_at(dot);
    let tim = stem.parse::<u64>().ok()?;
    let ext = ext.to_ascii_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(ImageKey::full(board, tim, ext))
}

/// Reverse of [`ImageKey::file_name`], used by the startup directory scan.
pub fn parse_cached_file(board: &str, variant: ImageVariant, name: &str) -> Option<ImageKey> {
    match variant {
        ImageVariant::Thumb => {
            let stem = name.strip_suffix("s.jpg")?;
            let tim = stem.parse::<u64>().ok()?;
            Some(ImageKey::thumb(board, tim))
        }
        ImageVariant::Full => {
            let dot = name.find('.')?;
            let (stem, ext) = name.split_at(dot);
            let tim = stem.parse::<u64>().ok()?;
            let ext = ext.to_ascii_lowercase();
            if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            Some(ImageKey::full(board, tim, ext))
        }
    }
}
