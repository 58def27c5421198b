//! The shapes an asset can be resolved to.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use super::AssetError;

/// How much of a cached file is needed to decode an [`Asset`] from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contents {
    /// The whole file.
    Full,
    /// At most this many leading bytes.
    Header(usize),
    /// Nothing but the path.
    PathOnly,
}

/// The raw form of an asset, as handed to [`Asset::decode`].
#[derive(Debug, Clone, Copy)]
pub struct AssetSource<'a> {
    /// The asset contents.
    ///
    /// When decoding from a file on disk, this only holds what [`Asset::CONTENTS`] asks for.
    pub bytes: &'a Bytes,
    /// The file holding the contents, if they are available on disk.
    pub path: Option<&'a Path>,
}

/// A value that can be produced from the bytes of an asset.
pub trait Asset: Clone + Send + Sync + 'static {
    /// Distinguishes the shapes of the same asset in the memory tier.
    const KIND: &'static str;

    /// The part of a cached file [`decode`](Self::decode) looks at.
    const CONTENTS: Contents = Contents::Full;

    /// Interprets the fetched contents.
    fn decode(source: AssetSource<'_>) -> Result<Self, AssetError>;

    /// Turns the value back into bytes, for seeding the disk tier.
    fn encode(&self) -> io::Result<Bytes>;

    /// The approximate size of the value in memory.
    fn weight(&self) -> u32;
}

fn weight_of(len: usize) -> u32 {
    len.try_into().unwrap_or(u32::MAX)
}

/// An opaque blob of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAsset(pub Bytes);

impl DataAsset {
    pub fn bytes(&self) -> &Bytes {
        &self.0
    }
}

impl Asset for DataAsset {
    const KIND: &'static str = "data";

    fn decode(source: AssetSource<'_>) -> Result<Self, AssetError> {
        Ok(Self(source.bytes.clone()))
    }

    fn encode(&self) -> io::Result<Bytes> {
        Ok(self.0.clone())
    }

    fn weight(&self) -> u32 {
        weight_of(self.0.len())
    }
}

/// The container format of an image, detected from its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Heic,
    Avif,
    Bmp,
    Tiff,
}

impl ImageFormat {
    /// Detects the format from the leading bytes of an image.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::WebP)
        } else if bytes.starts_with(b"BM") {
            Some(Self::Bmp)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(Self::Tiff)
        } else {
            match ftyp_brand(bytes)? {
                b"heic" | b"heix" | b"hevc" | b"mif1" | b"msf1" => Some(Self::Heic),
                b"avif" | b"avis" => Some(Self::Avif),
                _ => None,
            }
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Heic => "heic",
            Self::Avif => "avif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        }
    }
}

/// Returns the major brand of an ISO base media file.
fn ftyp_brand(bytes: &[u8]) -> Option<&[u8; 4]> {
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        bytes[8..12].try_into().ok()
    } else {
        None
    }
}

/// Encoded image data.
///
/// Only the container format is validated, the image is not decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    bytes: Bytes,
    format: ImageFormat,
}

impl ImageAsset {
    pub fn new(bytes: Bytes) -> Result<Self, AssetError> {
        let format = ImageFormat::sniff(&bytes)
            .ok_or_else(|| AssetError::Decode("unrecognized image format".into()))?;
        Ok(Self { bytes, format })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

impl Asset for ImageAsset {
    const KIND: &'static str = "image";

    fn decode(source: AssetSource<'_>) -> Result<Self, AssetError> {
        Self::new(source.bytes.clone())
    }

    fn encode(&self) -> io::Result<Bytes> {
        Ok(self.bytes.clone())
    }

    fn weight(&self) -> u32 {
        weight_of(self.bytes.len())
    }
}

/// A reference to the asset's file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAsset {
    path: Arc<Path>,
}

impl FileAsset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into().into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Asset for FileAsset {
    const KIND: &'static str = "file";
    const CONTENTS: Contents = Contents::PathOnly;

    fn decode(source: AssetSource<'_>) -> Result<Self, AssetError> {
        source.path.map(Self::new).ok_or(AssetError::NotPersisted)
    }

    fn encode(&self) -> io::Result<Bytes> {
        std::fs::read(&self.path).map(Bytes::from)
    }

    fn weight(&self) -> u32 {
        weight_of(self.path.as_os_str().len())
    }
}

/// The kind of a media file, detected from its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Mp4,
    QuickTime,
    M4a,
    Mp3,
    Wav,
    Avi,
    Ogg,
    Flac,
    Matroska,
}

impl MediaKind {
    /// Detects the media kind from the leading bytes of a file.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if let Some(brand) = ftyp_brand(bytes) {
            return match brand {
                b"qt  " => Some(Self::QuickTime),
                b"M4A " | b"M4B " => Some(Self::M4a),
                b"heic" | b"heix" | b"mif1" | b"avif" => None,
                _ => Some(Self::Mp4),
            };
        }

        let mpeg_frame = bytes.len() >= 2 && bytes[0] == 0xff && (bytes[1] & 0xe0) == 0xe0;
        if bytes.starts_with(b"ID3") || mpeg_frame {
            Some(Self::Mp3)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            Some(Self::Wav)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"AVI " {
            Some(Self::Avi)
        } else if bytes.starts_with(b"OggS") {
            Some(Self::Ogg)
        } else if bytes.starts_with(b"fLaC") {
            Some(Self::Flac)
        } else if bytes.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
            Some(Self::Matroska)
        } else {
            None
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Mp4 | Self::QuickTime | Self::Avi | Self::Matroska)
    }
}

/// A media file on disk, ready to be handed to a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    file: FileAsset,
    kind: MediaKind,
}

impl MediaAsset {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }
}

impl Asset for MediaAsset {
    const KIND: &'static str = "media";
    // enough for every signature `MediaKind::sniff` knows
    const CONTENTS: Contents = Contents::Header(64);

    fn decode(source: AssetSource<'_>) -> Result<Self, AssetError> {
        let kind = MediaKind::sniff(source.bytes)
            .ok_or_else(|| AssetError::Decode("unrecognized media format".into()))?;
        let file = FileAsset::decode(source)?;
        Ok(Self { file, kind })
    }

    fn encode(&self) -> io::Result<Bytes> {
        self.file.encode()
    }

    fn weight(&self) -> u32 {
        self.file.weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_image_formats() {
        assert_eq!(ImageFormat::sniff(PNG), Some(ImageFormat::Png));
        assert_eq!(
            ImageFormat::sniff(&[0xff, 0xd8, 0xff, 0xe0]),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(ImageFormat::sniff(b"GIF89a..."), Some(ImageFormat::Gif));
        assert_eq!(
            ImageFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "),
            Some(ImageFormat::WebP)
        );
        assert_eq!(
            ImageFormat::sniff(b"\0\0\0\x18ftypheic\0\0\0\0"),
            Some(ImageFormat::Heic)
        );
        assert_eq!(ImageFormat::sniff(b"hello"), None);
    }

    #[test]
    fn test_image_decode() {
        let bytes = Bytes::from_static(PNG);
        let image = ImageAsset::decode(AssetSource {
            bytes: &bytes,
            path: None,
        })
        .unwrap();
        assert_eq!(image.format(), ImageFormat::Png);
        assert_eq!(image.format().extension(), "png");

        let bytes = Bytes::from_static(b"<html>not found</html>");
        let err = ImageAsset::decode(AssetSource {
            bytes: &bytes,
            path: None,
        })
        .unwrap_err();
        assert!(matches!(err, AssetError::Decode(_)));
    }

    #[test]
    fn test_media_kinds() {
        let mp4 = b"\0\0\0\x20ftypisom\0\0\x02\0";
        assert_eq!(MediaKind::sniff(mp4), Some(MediaKind::Mp4));
        assert!(MediaKind::sniff(mp4).unwrap().is_video());
        assert_eq!(
            MediaKind::sniff(b"\0\0\0\x14ftypqt  \0\0\0\0"),
            Some(MediaKind::QuickTime)
        );
        assert_eq!(MediaKind::sniff(b"ID3\x04\0"), Some(MediaKind::Mp3));
        assert_eq!(
            MediaKind::sniff(b"RIFF\0\0\0\0WAVEfmt "),
            Some(MediaKind::Wav)
        );
        assert!(!MediaKind::Wav.is_video());
        assert_eq!(MediaKind::sniff(b"\0\0\0\x18ftypheic\0\0\0\0"), None);
        assert_eq!(MediaKind::sniff(PNG), None);
    }

    #[test]
    fn test_file_requires_path() {
        let bytes = Bytes::from_static(b"data");
        let err = FileAsset::decode(AssetSource {
            bytes: &bytes,
            path: None,
        })
        .unwrap_err();
        assert!(matches!(err, AssetError::NotPersisted));

        let file = FileAsset::decode(AssetSource {
            bytes: &bytes,
            path: Some(Path::new("/tmp/data")),
        })
        .unwrap();
        assert_eq!(file.path(), Path::new("/tmp/data"));
    }
}
