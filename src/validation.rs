//! Input validation for the Courier relay server

/// File extensions accepted by `sendFile`
///
/// Document, image, audio, video, archive, and office formats; an explicit
/// enumerated set rather than a MIME-based check.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "png", "jpg", "jpeg", "gif", "doc", "docx", "zip", "mp3", "mp4", "tgs", "webp",
    "json", "svg", "avi", "mov", "wav", "ogg", "rar", "7z", "ppt", "pptx", "xls", "xlsx",
];

/// Validates a user identifier
///
/// Requirements:
/// - 1-80 characters
/// - Alphanumeric characters plus underscore, hyphen, and dot
pub fn validate_user_id(user_id: &str) -> Result<(), String> {
    if user_id.is_empty() {
        return Err("User ID cannot be empty".to_string());
    }

    if user_id.len() > 80 {
        return Err("User ID must not exceed 80 characters".to_string());
    }

    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(
            "User ID can only contain alphanumeric characters, underscores, hyphens, and dots"
                .to_string(),
        );
    }

    Ok(())
}

/// Validates a display username
///
/// Requirements:
/// - 1-80 characters after trimming
pub fn validate_username(name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err("Username cannot be empty".to_string());
    }

    if trimmed.len() > 80 {
        return Err("Username must not exceed 80 characters".to_string());
    }

    Ok(())
}

/// Validates an email address
///
/// A light structural check: one `@` with a dot somewhere after it. The relay
/// never sends mail; the address is contact info only.
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email cannot be empty".to_string());
    }

    if email.len() > 120 {
        return Err("Email must not exceed 120 characters".to_string());
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err("Email must contain a single @".to_string());
    };

    if local.is_empty() || domain.is_empty() || !domain.contains('.') || email.contains(' ') {
        return Err("Email format is invalid".to_string());
    }

    Ok(())
}

/// Whether a filename's extension is in the allow-list
pub fn allowed_file(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        }
        _ => false,
    }
}

/// Reduce an uploaded filename to a safe single path component
///
/// Strips directory parts and replaces anything outside alphanumerics,
/// dot, underscore, and hyphen.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim_matches('.');

    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
