//! Tests for `src/canonical.rs`: stable chat keys for recipient sets.

use cellchat::canonical::{canonicalize, canonicalize_excluding};

#[test]
fn order_and_spelling_do_not_change_the_key() {
    let a = canonicalize("+12125550100,(212) 555-0101", Some("US"));
    let b = canonicalize(" 212.555.0101 , 1 212 555 0100 ", Some("US"));
    assert_eq!(a, b);
    assert_eq!(a.key, "+12125550100,+12125550101");
    assert!(a.is_group());
}

#[test]
fn duplicates_collapse_to_one_member() {
    let r = canonicalize("+1 555 0100,555-0100", Some("US"));
    assert_eq!(r.key, "+15550100");
    assert_eq!(r.members, vec!["+15550100"]);
    assert!(!r.is_group());
}

#[test]
fn alphanumeric_senders_are_kept_verbatim() {
    let r = canonicalize("  MyBank ", Some("US"));
    assert_eq!(r.key, "MyBank");
}

#[test]
fn blank_tokens_are_dropped() {
    assert!(canonicalize(" , ,", Some("US")).is_empty());
    assert_eq!(canonicalize(",+12125550100,", Some("US")).members.len(), 1);
}

#[test]
fn own_numbers_are_excluded_in_any_spelling() {
    let recipients = vec![
        "+15550009999".to_owned(),
        "(212) 555-0100".to_owned(),
        "212 555 0101".to_owned(),
    ];
    let own = vec!["555-000-9999".to_owned()];
    let r = canonicalize_excluding(&recipients, &own, Some("US"));
    assert_eq!(r.key, "+12125550100,+12125550101");
}

#[test]
fn excluding_everything_leaves_an_empty_set() {
    let r = canonicalize_excluding(
        &["+15550009999".to_owned()],
        &["+15550009999".to_owned()],
        Some("US"),
    );
    assert!(r.is_empty());
    assert_eq!(r.key, "");
}
