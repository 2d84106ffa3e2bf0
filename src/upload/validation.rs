/// Upload constraints and local validation
///
/// Everything here runs before any network call; a violation names the
/// constraint that failed.
use crate::{
    config::UploadConfig,
    error::{HubError, HubResult},
    upload::UploadFile,
};

/// Limits applied to one kind of upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConstraints {
    pub max_size: usize,
    /// Exact types or `type/*` wildcards
    pub allowed_mime_types: Vec<String>,
    pub max_files: usize,
    /// Recompress images before transfer
    pub compress: bool,
}

fn types(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl UploadConstraints {
    /// Event photo uploads, limits from configuration
    pub fn event_photos(config: &UploadConfig) -> Self {
        Self {
            max_size: config.max_file_size,
            allowed_mime_types: config.allowed_mime_types.clone(),
            max_files: config.max_files,
            compress: config.compress_images,
        }
    }

    pub fn avatars() -> Self {
        Self {
            max_size: 2 * 1024 * 1024,
            allowed_mime_types: types(&["image/jpeg", "image/png", "image/webp"]),
            max_files: 1,
            compress: true,
        }
    }

    pub fn documents() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            allowed_mime_types: types(&["application/pdf", "image/jpeg", "image/png"]),
            max_files: 5,
            compress: false,
        }
    }

    pub fn chat_attachments() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            allowed_mime_types: types(&["image/*", "application/pdf", "text/plain"]),
            max_files: 5,
            compress: true,
        }
    }

    pub fn allows(&self, mime_type: &str) -> bool {
        let mime_type = mime_type.to_ascii_lowercase();
        self.allowed_mime_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(prefix) => mime_type
                    .split_once('/')
                    .map(|(top, _)| top == prefix)
                    .unwrap_or(false),
                None => *allowed == mime_type,
            }
        })
    }
}

fn megabytes(bytes: usize) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// Check a single file against its constraints
pub fn validate_file(file: &UploadFile, constraints: &UploadConstraints) -> HubResult<()> {
    if file.name.trim().is_empty() {
        return Err(HubError::Validation("File name is required".to_string()));
    }
    if file.data.is_empty() {
        return Err(HubError::Validation(format!("File {} is empty", file.name)));
    }
    if file.data.len() > constraints.max_size {
        return Err(HubError::Validation(format!(
            "File {} is {}, over the max_size limit of {}",
            file.name,
            megabytes(file.data.len()),
            megabytes(constraints.max_size)
        )));
    }
    if !constraints.allows(&file.mime_type) {
        return Err(HubError::Validation(format!(
            "File {} has type {}, which is not in allowed_mime_types ({})",
            file.name,
            file.mime_type,
            constraints.allowed_mime_types.join(", ")
        )));
    }
    Ok(())
}

/// Check the batch size before looking at individual files
pub fn validate_batch_size(count: usize, constraints: &UploadConstraints) -> HubResult<()> {
    if count == 0 {
        return Err(HubError::Validation("No files to upload".to_string()));
    }
    if count > constraints.max_files {
        return Err(HubError::Validation(format!(
            "{} files exceed the max_files limit of {}",
            count, constraints.max_files
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn file(name: &str, mime: &str, size: usize) -> UploadFile {
        UploadFile {
            name: name.to_string(),
            mime_type: mime.to_string(),
            data: vec![0u8; size],
        }
    }

    #[test]
    fn test_size_limit_names_constraint() {
        let constraints = UploadConstraints::event_photos(&UploadConfig::default());
        let err = validate_file(&file("big.jpg", "image/jpeg", 11 * 1024 * 1024), &constraints)
            .unwrap_err();
        match err {
            HubError::Validation(message) => {
                assert!(message.contains("max_size"));
                assert!(message.contains("11.0 MB"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_mime_type_rules() {
        let constraints = UploadConstraints::event_photos(&UploadConfig::default());
        assert_ok!(validate_file(&file("a.png", "image/png", 10), &constraints));
        assert_ok!(validate_file(&file("a.png", "IMAGE/PNG", 10), &constraints));
        assert_err!(validate_file(&file("a.gif", "image/gif", 10), &constraints));

        let chat = UploadConstraints::chat_attachments();
        assert!(chat.allows("image/gif"));
        assert!(chat.allows("application/pdf"));
        assert!(!chat.allows("application/zip"));
        assert!(!chat.allows("imagefoo"));
    }

    #[test]
    fn test_empty_and_unnamed_files() {
        let constraints = UploadConstraints::documents();
        assert!(validate_file(&file("a.pdf", "application/pdf", 0), &constraints).is_err());
        assert!(validate_file(&file(" ", "application/pdf", 3), &constraints).is_err());
    }

    #[test]
    fn test_batch_size() {
        let constraints = UploadConstraints::avatars();
        assert_ok!(validate_batch_size(1, &constraints));
        assert_err!(validate_batch_size(0, &constraints));
        assert_err!(validate_batch_size(2, &constraints));
    }
}
