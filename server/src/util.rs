//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME`; anything else passes through.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return Cow::Borrowed(path),
    };
    match std::env::var("HOME") {
        Ok(home) => Cow::Owned(format!("{home}{rest}")),
        Err(_) => Cow::Borrowed(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/work"), format!("{home}/work"));
        assert_eq!(expand_tilde("~other/x"), "~other/x");
        assert_eq!(expand_tilde("/srv/data"), "/srv/data");
    }
}
