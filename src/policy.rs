//! Encryption-mode and upload-validation policy (C7). Pure decision logic
//! with no I/O, grounded on the teacher's `DropConfig` validation helpers
//! generalized from "is this drop config sane" to "should this file be
//! protected, and is this upload safe to accept".

use std::path::Path;

const SENSITIVE_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "xlsx", "pptx", "key", "pem", "p12", "db", "sqlite", "env", "ini",
];

const DISALLOWED_UPLOAD_EXTENSIONS: &[&str] = &["exe", "bat", "cmd", "sh", "php"];

const SENSITIVE_SIZE_GATE_BYTES: u64 = 500 * 1024 * 1024;

/// Caller-requested override of the automatic mode decision, per the
/// spec's "encryption mode is a tri-state override, not a boolean" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionOverride {
    Auto,
    ForceUser,
    ForceNone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    None,
    User,
    /// Reserved for administrator-mandated encryption; not implemented
    /// (requests asking for it get a 501).
    System,
}

pub fn determine_mode(filename: &str, size: u64, ov: EncryptionOverride) -> ContentMode {
    match ov {
        EncryptionOverride::ForceUser => ContentMode::User,
        EncryptionOverride::ForceNone => ContentMode::None,
        EncryptionOverride::Auto => {
            if is_sensitive_extension(filename) && size <= SENSITIVE_SIZE_GATE_BYTES {
                ContentMode::User
            } else {
                ContentMode::None
            }
        }
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

fn is_sensitive_extension(filename: &str) -> bool {
    extension_of(filename)
        .map(|ext| SENSITIVE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRejection {
    TooLarge { cap: u64 },
    InvalidFilename(String),
    DisallowedExtension(String),
    ContentMismatch,
}

/// Validate an incoming upload before it ever touches the storage backend:
/// size cap, path/NUL safety, disallowed extensions, and (for image
/// extensions) a content sniff against the first bytes of the body.
pub fn validate_upload(
    filename: &str,
    declared_size: u64,
    cap_bytes: u64,
    sniff_prefix: &[u8],
) -> Result<(), UploadRejection> {
    if declared_size > cap_bytes {
        return Err(UploadRejection::TooLarge { cap: cap_bytes });
    }

    if filename.is_empty()
        || filename.as_bytes().contains(&0)
        || filename.contains('/')
        || filename.contains('\\')
        || filename == "."
        || filename == ".."
    {
        return Err(UploadRejection::InvalidFilename(filename.to_string()));
    }

    if let Some(ext) = extension_of(filename) {
        if DISALLOWED_UPLOAD_EXTENSIONS.contains(&ext.as_str()) {
            return Err(UploadRejection::DisallowedExtension(ext));
        }
        if matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "gif") && !sniff_prefix.is_empty() {
            if !sniff_matches_extension(&ext, sniff_prefix) {
                return Err(UploadRejection::ContentMismatch);
            }
        }
    }

    Ok(())
}

fn sniff_matches_extension(ext: &str, prefix: &[u8]) -> bool {
    match ext {
        "png" => prefix.starts_with(&[0x89, 0x50, 0x4E, 0x47]),
        "jpg" | "jpeg" => prefix.starts_with(&[0xFF, 0xD8, 0xFF]),
        "gif" => prefix.starts_with(b"GIF87a") || prefix.starts_with(b"GIF89a"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_small_file_routes_to_user_mode() {
        assert_eq!(determine_mode("payroll.xlsx", 1024, EncryptionOverride::Auto), ContentMode::User);
    }

    #[test]
    fn sensitive_oversized_file_falls_back_to_none() {
        let oversized = SENSITIVE_SIZE_GATE_BYTES + 1;
        assert_eq!(determine_mode("archive.db", oversized, EncryptionOverride::Auto), ContentMode::None);
    }

    #[test]
    fn non_sensitive_extension_defaults_to_none() {
        assert_eq!(determine_mode("photo.jpg", 1024, EncryptionOverride::Auto), ContentMode::None);
    }

    #[test]
    fn force_overrides_win_regardless_of_extension() {
        assert_eq!(determine_mode("photo.jpg", 1024, EncryptionOverride::ForceUser), ContentMode::User);
        assert_eq!(determine_mode("secret.pem", 1024, EncryptionOverride::ForceNone), ContentMode::None);
    }

    #[test]
    fn rejects_oversized_upload() {
        let result = validate_upload("file.txt", 100, 50, &[]);
        assert_eq!(result, Err(UploadRejection::TooLarge { cap: 50 }));
    }

    #[test]
    fn rejects_path_like_filename() {
        let result = validate_upload("../escape.txt", 10, 100, &[]);
        assert!(matches!(result, Err(UploadRejection::InvalidFilename(_))));
    }

    #[test]
    fn rejects_disallowed_extension() {
        let result = validate_upload("payload.exe", 10, 100, &[]);
        assert_eq!(result, Err(UploadRejection::DisallowedExtension("exe".to_string())));
    }

    #[test]
    fn rejects_mismatched_image_content() {
        let result = validate_upload("photo.png", 10, 100, b"not a png");
        assert_eq!(result, Err(UploadRejection::ContentMismatch));
    }

    #[test]
    fn accepts_matching_png_sniff() {
        let png_header = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A];
        let result = validate_upload("photo.png", 10, 100, &png_header);
        assert!(result.is_ok());
    }
}
