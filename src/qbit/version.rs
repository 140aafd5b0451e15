//! Version-gated request shaping
//!
//! qBittorrent changed several request parameters across releases:
//! `contentLayout` replaced the `root_folder` boolean in 4.3.2, and the
//! `tags` parameter on add only exists from 4.2.0. The client compares the
//! version reported after login against those thresholds to pick the shape.

/// Returns true when `reported` is at least `target`.
///
/// Components are compared numerically per dot-separated segment, with the
/// shorter version padded with zeros, so "4.10.0" is newer than "4.3.2"
/// despite sorting before it lexicographically. A leading `v` on the
/// reported version is ignored.
///
/// When the version is unknown (the post-login probe failed) we assume the
/// newer behavior is supported: sending the modern shape to a server we
/// could not identify beats silently downgrading every request.
pub fn is_at_least(reported: Option<&str>, target: &str) -> bool {
    let Some(reported) = reported else {
        return true;
    };
    let a = components(reported.trim().trim_start_matches('v'));
    let b = components(target);

    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    true
}

fn components(v: &str) -> Vec<u64> {
    v.split('.').map(|p| p.trim().parse().unwrap_or(0)).collect()
}

/// How to encode the requested content layout for a given remote version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLayoutParam {
    /// 4.3.2+: pass the layout name through as `contentLayout`.
    ContentLayout(String),
    /// Pre-4.3.2: the closest `root_folder` boolean.
    RootFolder(bool),
    /// Pre-4.3.2 `Original` layout, which was the implicit default.
    Omit,
}

/// Picks the wire encoding for a content layout against a reported version.
pub fn content_layout_param(reported: Option<&str>, layout: &str) -> ContentLayoutParam {
    if is_at_least(reported, "4.3.2") {
        return ContentLayoutParam::ContentLayout(layout.to_string());
    }
    match layout {
        "Subfolder" => ContentLayoutParam::RootFolder(true),
        "NoSubfolder" => ContentLayoutParam::RootFolder(false),
        _ => ContentLayoutParam::Omit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_versions_pass() {
        assert!(is_at_least(Some("4.3.2"), "4.3.2"));
    }

    #[test]
    fn older_version_fails() {
        assert!(!is_at_least(Some("4.3.1"), "4.3.2"));
        assert!(!is_at_least(Some("3.9.9"), "4.3.2"));
    }

    #[test]
    fn component_wise_not_lexicographic() {
        // "4.10.0" < "4.3.2" as strings but is the newer release
        assert!(is_at_least(Some("4.10.0"), "4.3.2"));
    }

    #[test]
    fn missing_components_pad_with_zero() {
        assert!(is_at_least(Some("4.4"), "4.3.2"));
        assert!(!is_at_least(Some("4.3"), "4.3.2"));
        assert!(is_at_least(Some("5"), "4.3.2"));
    }

    #[test]
    fn leading_v_is_stripped() {
        assert!(is_at_least(Some("v4.3.2"), "4.3.2"));
    }

    #[test]
    fn unknown_version_assumes_newer() {
        assert!(is_at_least(None, "4.3.2"));
    }

    #[test]
    fn content_layout_uses_modern_param_from_4_3_2() {
        assert_eq!(
            content_layout_param(Some("4.3.2"), "Subfolder"),
            ContentLayoutParam::ContentLayout("Subfolder".into())
        );
        assert_eq!(
            content_layout_param(None, "NoSubfolder"),
            ContentLayoutParam::ContentLayout("NoSubfolder".into())
        );
    }

    #[test]
    fn content_layout_maps_to_root_folder_before_4_3_2() {
        assert_eq!(
            content_layout_param(Some("4.3.1"), "Subfolder"),
            ContentLayoutParam::RootFolder(true)
        );
        assert_eq!(
            content_layout_param(Some("4.3.1"), "NoSubfolder"),
            ContentLayoutParam::RootFolder(false)
        );
        assert_eq!(
            content_layout_param(Some("4.3.1"), "Original"),
            ContentLayoutParam::Omit
        );
    }
}
