use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed address")]
pub struct MalformedAddress;

/// Split a mail address into its lowercased `(mailbox, domain)` parts.
///
/// Exactly one `@` is required and neither side may be empty.
/// The sole token `postmaster` (any case) is accepted with an empty
/// domain, per RFC 5321 §4.1.1.3.
pub fn split_address(addr: &str) -> Result<(String, String), MalformedAddress> {
    let mut parts = addr.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(single), None, _) => {
            if single.eq_ignore_ascii_case("postmaster") {
                Ok((single.to_lowercase(), String::new()))
            } else {
                Err(MalformedAddress)
            }
        }
        (Some(mailbox), Some(domain), None) => {
            if mailbox.is_empty() || domain.is_empty() {
                return Err(MalformedAddress);
            }
            Ok((mailbox.to_lowercase(), domain.to_lowercase()))
        }
        _ => Err(MalformedAddress),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regular_address() {
        k9::assert_equal!(
            split_address("Alice@Example.ORG"),
            Ok(("alice".to_string(), "example.org".to_string()))
        );
    }

    #[test]
    fn postmaster() {
        k9::assert_equal!(
            split_address("Postmaster"),
            Ok(("postmaster".to_string(), String::new()))
        );
    }

    #[test]
    fn malformed() {
        k9::assert_equal!(split_address(""), Err(MalformedAddress));
        k9::assert_equal!(split_address("no-domain@"), Err(MalformedAddress));
        k9::assert_equal!(split_address("@no-mailbox"), Err(MalformedAddress));
        k9::assert_equal!(split_address("a@b@c"), Err(MalformedAddress));
        k9::assert_equal!(split_address("not-postmaster"), Err(MalformedAddress));
    }
}
