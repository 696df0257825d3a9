//! Deciding whether a relay's advertised software version is acceptable.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Recommended,
    Obsolete,
    /// No version known for the relay; nothing to judge.
    Unknown,
}

/// Compare a relay's version against the recommended list.
///
/// A `-dev` build passes when it is newer than everything recommended or
/// when its release form is itself recommended.
pub fn version_status(client: Option<&str>, recommended: &[String]) -> VersionStatus {
    let Some(client) = client.filter(|value| !value.is_empty()) else {
        return VersionStatus::Unknown;
    };

    if recommended.is_empty() {
        return VersionStatus::Recommended;
    }

    if recommended.iter().any(|version| version == client) {
        return VersionStatus::Recommended;
    }

    if let Some(release) = client.strip_suffix("-dev") {
        let newest_recommended =
            recommended.iter().all(|version| compare_versions(client, version).is_ge());
        if newest_recommended {
            return VersionStatus::Recommended;
        }
        if recommended.iter().any(|version| version == release) {
            return VersionStatus::Recommended;
        }
    }

    VersionStatus::Obsolete
}

/// Numeric dotted-version comparison; non-numeric suffixes are ignored.
fn compare_versions(left: &str, right: &str) -> std::cmp::Ordering {
    let left_key = version_key(left);
    let right_key = version_key(right);
    left_key.cmp(&right_key)
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .split(['.', '-'])
        .map_while(|segment| segment.parse::<u64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recommended() -> Vec<String> {
        vec!["0.4.7.16".into(), "0.4.8.10".into(), "0.4.8.12".into()]
    }

    #[test]
    fn listed_version_is_recommended() {
        assert_eq!(version_status(Some("0.4.8.12"), &recommended()), VersionStatus::Recommended);
    }

    #[test]
    fn unlisted_version_is_obsolete() {
        assert_eq!(version_status(Some("0.4.6.1"), &recommended()), VersionStatus::Obsolete);
    }

    #[test]
    fn missing_version_is_unknown() {
        assert_eq!(version_status(None, &recommended()), VersionStatus::Unknown);
        assert_eq!(version_status(Some(""), &recommended()), VersionStatus::Unknown);
    }

    #[test]
    fn empty_recommendation_list_accepts_anything() {
        assert_eq!(version_status(Some("0.0.1"), &[]), VersionStatus::Recommended);
    }

    #[test]
    fn dev_build_newer_than_all_recommended_passes() {
        assert_eq!(
            version_status(Some("0.4.9.1-dev"), &recommended()),
            VersionStatus::Recommended
        );
    }

    #[test]
    fn dev_build_of_recommended_release_passes() {
        assert_eq!(
            version_status(Some("0.4.8.10-dev"), &recommended()),
            VersionStatus::Recommended
        );
    }

    #[test]
    fn stale_dev_build_is_obsolete() {
        assert_eq!(version_status(Some("0.4.6.1-dev"), &recommended()), VersionStatus::Obsolete);
    }

    #[test]
    fn version_keys_compare_numerically() {
        assert!(compare_versions("0.4.10.1", "0.4.9.9").is_gt());
        assert!(compare_versions("0.4.8.12", "0.4.8.12").is_eq());
        assert!(compare_versions("0.3.5.7", "0.4.0.0").is_lt());
    }
}
