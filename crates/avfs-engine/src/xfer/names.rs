//! Candidate names for resolving clashes at the target.

/// Give up on finding a free name after this many candidates.
pub(crate) const MAX_CANDIDATES: u32 = 10_000;

/// The `n`th alternative for `name`: "file.txt" becomes "file (n).txt".
///
/// Hidden files keep their leading dot as part of the stem, so ".profile"
/// becomes ".profile (n)".
pub(crate) fn unique_name(name: &str, n: u32) -> String {
    let (stem, extension) = match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(dot) => (&name[..dot], Some(&name[dot + 1..])),
    };

    match extension {
        Some(ext) if !ext.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name() {
        assert_eq!(unique_name("test.txt", 1), "test (1).txt");
        assert_eq!(unique_name("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(unique_name("README", 3), "README (3)");
        assert_eq!(unique_name(".profile", 1), ".profile (1)");
        assert_eq!(unique_name("trailing.", 1), "trailing. (1)");
    }
}
