//! Object format codes and the filename-extension lookup.

/// Well-known PTP/MTP object format codes.
pub mod format {
    pub const UNDEFINED: u16 = 0x3000;
    pub const ASSOCIATION: u16 = 0x3001;
    pub const TEXT: u16 = 0x3004;
    pub const WAV: u16 = 0x3008;
    pub const MP3: u16 = 0x3009;
    pub const AVI: u16 = 0x300A;
    pub const MPEG: u16 = 0x300B;
    pub const EXIF_JPEG: u16 = 0x3801;
    pub const BMP: u16 = 0x3804;
    pub const GIF: u16 = 0x3807;
    pub const PNG: u16 = 0x380B;
    pub const TIFF: u16 = 0x380D;
    pub const WMA: u16 = 0xB901;
    pub const OGG: u16 = 0xB902;
    pub const AAC: u16 = 0xB903;
    pub const FLAC: u16 = 0xB906;
}

/// Maps a filename to an object format code by extension, case-insensitively.
/// Unrecognized extensions and extension-less names map to Undefined.
pub fn for_filename(name: &str) -> u16 {
    let ext = match name.rsplit_once('.') {
        // A leading dot alone ("".gitignore") is a hidden name, not an extension.
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return format::UNDEFINED,
    };
    match ext.as_str() {
        "jpg" | "jpeg" => format::EXIF_JPEG,
        "png" => format::PNG,
        "gif" => format::GIF,
        "bmp" => format::BMP,
        "tif" | "tiff" => format::TIFF,
        "mp4" | "mpg" | "mpeg" => format::MPEG,
        "avi" => format::AVI,
        "mp3" => format::MP3,
        "wav" => format::WAV,
        "wma" => format::WMA,
        "ogg" => format::OGG,
        "aac" => format::AAC,
        "flac" => format::FLAC,
        "txt" => format::TEXT,
        _ => format::UNDEFINED,
    }
}

/// Directories travel as Association objects.
pub fn is_directory(format_code: u16) -> bool {
    format_code == format::ASSOCIATION
}
