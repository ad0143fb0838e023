//! Recipient canonicalization.
//!
//! A chat with several participants is identified by its member set, not by
//! the order or formatting in which a modem, a delegate or the user happened
//! to report it. [`canonicalize`] reduces any recipient string to a stable
//! key: normalize each number, sort, drop duplicates, join with commas.

use crate::phone;

/// Separator between numbers in recipient strings and chat keys.
pub const SEPARATOR: char = ',';

/// Canonical identity of a recipient set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipients {
    /// Sorted, deduplicated, comma-joined normalized numbers.
    pub key: String,
    /// The same numbers as an ordered list, for new-chat membership.
    pub members: Vec<String>,
}

impl Recipients {
    /// Whether the set addresses more than one participant.
    pub fn is_group(&self) -> bool {
        self.members.len() > 1
    }

    /// Whether the set is empty (no usable tokens in the input).
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Canonicalize a comma-separated recipient string.
///
/// Tokens that fail normalization are kept verbatim (trimmed), so
/// alphanumeric senders and short codes still get a stable key.
pub fn canonicalize(recipients: &str, country: Option<&str>) -> Recipients {
    canonicalize_all(recipients.split(SEPARATOR), country)
}

/// Canonicalize an already-split list of recipients.
pub fn canonicalize_all<'a, I>(tokens: I, country: Option<&str>) -> Recipients
where
    I: IntoIterator<Item = &'a str>,
{
    let mut members: Vec<String> = tokens
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| phone::normalize(t, country).unwrap_or_else(|_| t.to_owned()))
        .collect();

    // dedup only removes adjacent duplicates
    members.sort();
    members.dedup();

    let key = members.join(&SEPARATOR.to_string());
    Recipients { key, members }
}

/// Canonicalize `recipients` after removing any of `own_numbers`.
///
/// Used for group messages, where the delegate reports our own number among
/// the recipients.
pub fn canonicalize_excluding(
    recipients: &[String],
    own_numbers: &[String],
    country: Option<&str>,
) -> Recipients {
    let own = canonicalize_all(own_numbers.iter().map(String::as_str), country);
    let mut all = canonicalize_all(recipients.iter().map(String::as_str), country);
    all.members.retain(|m| !own.members.contains(m));
    all.key = all.members.join(&SEPARATOR.to_string());
    all
}
