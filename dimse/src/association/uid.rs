//! UIDs as they travel in association PDUs.
//!
//! UID fields are padded to an even length with a trailing NUL,
//! and some peers pad them with spaces instead.
//! Neither belongs to the UID when comparing it.

use std::borrow::Cow;

fn is_padding(c: char) -> bool {
    c == '\0' || c == ' '
}

/// Remove the trailing padding of a UID.
///
/// Borrowed UIDs stay borrowed.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    let len = uid.trim_end_matches(is_padding).len();
    if len == uid.len() {
        return uid;
    }
    match uid {
        Cow::Borrowed(uid) => Cow::Borrowed(&uid[..len]),
        Cow::Owned(mut uid) => {
            uid.truncate(len);
            Cow::Owned(uid)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use rstest::rstest;

    use super::trim_uid;

    #[rstest]
    #[case("1.2.3.4", "1.2.3.4")]
    #[case("1.2.3.4\0", "1.2.3.4")]
    #[case("1.2.3.45\0\0", "1.2.3.45")]
    #[case("1.2.840.10008.1.1 ", "1.2.840.10008.1.1")]
    #[case("\0", "")]
    fn padding_is_trimmed(#[case] uid: &str, #[case] expected: &str) {
        assert_eq!(trim_uid(Cow::from(uid)), expected);
        assert_eq!(trim_uid(Cow::from(uid.to_string())), expected);
    }

    #[test]
    fn trimming_does_not_allocate() {
        let uid = trim_uid(Cow::from("1.2.3.4\0"));
        assert!(matches!(uid, Cow::Borrowed("1.2.3.4")));
    }
}
