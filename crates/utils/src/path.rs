use std::path::PathBuf;

/// Expand a leading `~` to the current user's home directory.
///
/// Paths without a tilde, or for which no home directory is known, are
/// returned unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/tb.db"), PathBuf::from("/var/lib/tb.db"));
        assert_eq!(expand_tilde("relative/db"), PathBuf::from("relative/db"));
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        let expanded = expand_tilde("~/boards.sqlite");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("boards.sqlite"));
    }
}
