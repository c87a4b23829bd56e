//! Extension-driven file classification.
//!
//! Closed enumerations kept as data tables; `other` / octet-stream are the
//! fallbacks for anything unlisted.

use sandrun_protocol::FileKind;

const KIND_BY_EXTENSION: &[(&str, FileKind)] = &[
    ("png", FileKind::Image),
    ("jpg", FileKind::Image),
    ("jpeg", FileKind::Image),
    ("gif", FileKind::Image),
    ("bmp", FileKind::Image),
    ("svg", FileKind::Image),
    ("webp", FileKind::Image),
    ("pt", FileKind::Model),
    ("pth", FileKind::Model),
    ("onnx", FileKind::Model),
    ("safetensors", FileKind::Model),
    ("gguf", FileKind::Model),
    ("ckpt", FileKind::Model),
    ("mp4", FileKind::Video),
    ("avi", FileKind::Video),
    ("mkv", FileKind::Video),
    ("webm", FileKind::Video),
    ("mov", FileKind::Video),
    ("mp3", FileKind::Audio),
    ("wav", FileKind::Audio),
    ("flac", FileKind::Audio),
    ("ogg", FileKind::Audio),
    ("csv", FileKind::Data),
    ("json", FileKind::Data),
    ("jsonl", FileKind::Data),
    ("parquet", FileKind::Data),
    ("npy", FileKind::Data),
    ("npz", FileKind::Data),
    ("yaml", FileKind::Data),
    ("yml", FileKind::Data),
    ("toml", FileKind::Data),
    ("xml", FileKind::Data),
    ("txt", FileKind::Text),
    ("log", FileKind::Text),
    ("out", FileKind::Text),
    ("tar", FileKind::Archive),
    ("gz", FileKind::Archive),
    ("tgz", FileKind::Archive),
    ("zip", FileKind::Archive),
    ("zst", FileKind::Archive),
    ("bz2", FileKind::Archive),
    ("xz", FileKind::Archive),
    ("py", FileKind::Code),
    ("rs", FileKind::Code),
    ("js", FileKind::Code),
    ("ts", FileKind::Code),
    ("sh", FileKind::Code),
    ("c", FileKind::Code),
    ("cpp", FileKind::Code),
    ("h", FileKind::Code),
    ("go", FileKind::Code),
    ("rb", FileKind::Code),
    ("lua", FileKind::Code),
    ("pdf", FileKind::Document),
    ("md", FileKind::Document),
    ("html", FileKind::Document),
    ("rst", FileKind::Document),
];

const MIME_BY_EXTENSION: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("jsonl", "application/jsonl"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    ("xml", "application/xml"),
    ("txt", "text/plain"),
    ("log", "text/plain"),
    ("out", "text/plain"),
    ("md", "text/markdown"),
    ("rst", "text/x-rst"),
    ("html", "text/html"),
    ("pdf", "application/pdf"),
    ("tar", "application/x-tar"),
    ("gz", "application/gzip"),
    ("tgz", "application/gzip"),
    ("zip", "application/zip"),
    ("zst", "application/zstd"),
    ("bz2", "application/x-bzip2"),
    ("xz", "application/x-xz"),
    ("py", "text/x-python"),
    ("rs", "text/x-rust"),
    ("js", "text/javascript"),
    ("ts", "text/typescript"),
    ("sh", "text/x-shellscript"),
    ("c", "text/x-c"),
    ("cpp", "text/x-c++"),
    ("h", "text/x-c"),
    ("go", "text/x-go"),
    ("rb", "text/x-ruby"),
    ("lua", "text/x-lua"),
];

fn extension_of(path: &str) -> Option<String> {
    let basename = path.rsplit('/').next()?;
    let (_, ext) = basename.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Classify a relative path by extension, case-insensitive; `Other` when
/// unlisted or extensionless.
pub fn classify(path: &str) -> FileKind {
    let Some(ext) = extension_of(path) else {
        return FileKind::Other;
    };
    KIND_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, kind)| *kind)
        .unwrap_or(FileKind::Other)
}

/// MIME string for a relative path; octet-stream when unlisted.
pub fn mime_for(path: &str) -> &'static str {
    let Some(ext) = extension_of(path) else {
        return "application/octet-stream";
    };
    MIME_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("photo.PNG"), FileKind::Image);
        assert_eq!(classify("weights.SafeTensors"), FileKind::Model);
        assert_eq!(classify("out/result.TXT"), FileKind::Text);
    }

    #[test]
    fn unknown_and_extensionless_fall_back_to_other() {
        assert_eq!(classify("Makefile"), FileKind::Other);
        assert_eq!(classify("data.weird"), FileKind::Other);
        assert_eq!(classify("trailingdot."), FileKind::Other);
        assert_eq!(mime_for("Makefile"), "application/octet-stream");
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_for("a.png"), "image/png");
        assert_eq!(mime_for("b.json"), "application/json");
        assert_eq!(mime_for("script.py"), "text/x-python");
    }

    #[test]
    fn only_the_last_extension_counts() {
        assert_eq!(classify("archive.tar.gz"), FileKind::Archive);
        assert_eq!(mime_for("archive.tar.gz"), "application/gzip");
    }
}
