//! File name sanitization for names announced by a remote peer.

/// Reduces a (possibly adversarial) announced name to one safe file name.
///
/// Directory components are discarded, only the last non-`.`/`..` segment is
/// kept. Characters other than alphanumerics and `.`, `-`, `_`, ` ` are
/// dropped, as are leading dots. Falls back to `"file"`.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|part| !part.is_empty() && !matches!(*part, "." | ".."))
        .next_back()
        .unwrap_or_default();

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim().trim_start_matches('.');

    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}
