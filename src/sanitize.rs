/// Filename sanitization for persisted transfers.
///
/// Strips path components, drops disallowed characters (rather than
/// substituting them), rejects results that collapse to nothing
/// meaningful, and caps the length.
pub fn sanitize_filename(raw: &str, max_len: usize) -> Option<String> {
    let basename = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    let filtered: String = basename
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-' || *c == '_')
        .collect();

    if filtered.is_empty() || filtered == "." || filtered == ".." {
        return None;
    }

    let truncated = if filtered.len() > max_len {
        let mut end = max_len;
        while !filtered.is_char_boundary(end) {
            end -= 1;
        }
        filtered[..end].to_string()
    } else {
        filtered
    };

    if truncated.is_empty() || truncated == "." || truncated == ".." {
        return None;
    }

    Some(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd", 255), Some("etcpasswd".to_string()));
    }

    #[test]
    fn strips_windows_path_components() {
        assert_eq!(sanitize_filename(r"C:\Users\me\report.pdf", 255), Some("report.pdf".to_string()));
    }

    #[test]
    fn keeps_plain_filenames() {
        assert_eq!(sanitize_filename("a.bin", 255), Some("a.bin".to_string()));
    }

    #[test]
    fn rejects_empty_after_filtering() {
        assert_eq!(sanitize_filename("///", 255), None);
        assert_eq!(sanitize_filename("***", 255), None);
    }

    #[test]
    fn rejects_dot_and_dotdot() {
        assert_eq!(sanitize_filename(".", 255), None);
        assert_eq!(sanitize_filename("..", 255), None);
    }

    #[test]
    fn truncates_to_max_length() {
        let long = "a".repeat(300);
        let result = sanitize_filename(&long, 255).unwrap();
        assert_eq!(result.len(), 255);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(sanitize_filename("", 255), None);
    }
}
