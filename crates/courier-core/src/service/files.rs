//! File naming helpers.

use std::path::Path;

use chrono::{DateTime, FixedOffset};
use ulid::Ulid;

/// Directory name for an upload: `%Y%m%d%H%M%S` of `timestamp` in `offset`.
pub fn time_dir(timestamp: i64, offset: FixedOffset) -> Option<String> {
    DateTime::from_timestamp(timestamp, 0)
        .map(|at| at.with_timezone(&offset).format("%Y%m%d%H%M%S").to_string())
}

/// Collision-free stored name: the key as 32 hex digits plus the original
/// extension, if any.
pub fn stored_name(key: Ulid, original: &str) -> String {
    match Path::new(original).extension() {
        Some(ext) => format!("{:032x}.{}", key.0, ext.to_string_lossy()),
        None => format!("{:032x}", key.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn time_dir_uses_the_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let shanghai = FixedOffset::east_opt(8 * 3600).unwrap();

        assert_eq!(time_dir(1_704_110_400, utc).as_deref(), Some("20240101120000"));
        assert_eq!(time_dir(1_704_110_400, shanghai).as_deref(), Some("20240101200000"));
        assert_eq!(time_dir(i64::MAX, utc), None);
    }

    #[rstest]
    #[case("photo.jpg", ".jpg")]
    #[case("archive.tar.gz", ".gz")]
    #[case("README", "")]
    fn stored_name_keeps_last_extension(#[case] original: &str, #[case] suffix: &str) {
        let key = Ulid::from_parts(1, 2);
        let name = stored_name(key, original);

        assert_eq!(name.len(), 32 + suffix.len());
        assert!(name.ends_with(suffix));
        assert!(name[..32].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_keys_give_distinct_names() {
        assert_ne!(
            stored_name(Ulid::new(), "a.jpg"),
            stored_name(Ulid::new(), "a.jpg")
        );
    }
}
