//! Tests for `src/account/receive.rs`: inbound SMS handling.

use cellchat::chat::{Direction, MessageStatus};
use cellchat::modem::{DevicePath, PduKind, SmsEntry, SmsState, TransportEvent};

use crate::support::{inbound, modem, sms_path, Call, Harness, Setup};

fn persisted_body(call: &Call, wanted: &str) -> bool {
    matches!(call, Call::Persist { body, .. } if body == wanted)
}

#[tokio::test(start_paused = true)]
async fn one_sender_in_two_formats_shares_a_chat() {
    let mut setup = Setup::with_modem()
        .entry(inbound(1, "+12125550100", "one"))
        .entry(inbound(2, "(212) 555-0100", "two"));
    setup
        .contacts
        .insert("212-555-0100".to_owned(), "Alice".to_owned());
    let mut h = Harness::start(setup);

    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    h.call(|c| c.is_delete_of(&sms_path(2))).await;
    for (n, body) in [(1, "one"), (2, "two")] {
        let persisted = h.position(|c| persisted_body(c, body));
        let deleted = h.position(|c| c.is_delete_of(&sms_path(n)));
        assert!(persisted.is_some());
        assert!(persisted < deleted, "{body} deleted before it was stored");
    }

    let chats = h.handle.chats().await.expect("running");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].key, "+12125550100");
    assert_eq!(chats[0].unread_count, 2);

    let messages = h.handle.messages("+12125550100").await.expect("chat exists");
    assert_eq!(messages.len(), 2);
    for m in &messages {
        assert_eq!(m.direction, Direction::In);
        assert_eq!(m.status, MessageStatus::Received);
        assert_eq!(m.sender.as_deref(), Some("+12125550100"));
    }
}

#[tokio::test(start_paused = true)]
async fn local_and_international_spellings_share_a_chat() {
    let mut h = Harness::start(
        Setup::with_modem()
            .entry(inbound(1, "555-0100", "local"))
            .entry(inbound(2, "+1 555 0100", "international")),
    );

    h.call(|c| c.is_delete_of(&sms_path(2))).await;
    h.call(|c| c.is_delete_of(&sms_path(1))).await;

    let chats = h.handle.chats().await.expect("running");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].key, "+15550100");
}

#[tokio::test(start_paused = true)]
async fn notifications_wait_for_contacts() {
    let mut setup = Setup::with_modem()
        .entry(inbound(1, "+12125550100", "one"))
        .entry(inbound(2, "+12125550100", "two"));
    setup
        .contacts
        .insert("+12125550100".to_owned(), "Alice".to_owned());
    let mut h = Harness::start(setup);

    h.call(|c| c.is_delete_of(&sms_path(2))).await;
    assert!(h.notifier.received().is_empty());

    // one notification per chat, for the latest message
    assert_eq!(h.handle.contacts_ready().await.expect("running"), 1);
    assert_eq!(
        h.notifier.received(),
        vec![("Alice".to_owned(), "two".to_owned())]
    );

    h.modem.push(&modem(), inbound(3, "+12125550100", "three"));
    h.message_added(&sms_path(3)).await;
    h.call(|c| c.is_delete_of(&sms_path(3))).await;
    assert_eq!(h.notifier.received().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_persist_leaves_the_message_on_the_modem() {
    let mut h = Harness::start(Setup::with_modem().entry(inbound(1, "+12125550100", "keep me")));
    h.history.fail(true);

    h.call(|c| persisted_body(c, "keep me")).await;
    h.settle().await;
    assert_eq!(h.count(|c| c.is_delete_of(&sms_path(1))), 0);
    assert!(h.modem.contains(&sms_path(1)));

    // the next listing retries it
    h.history.fail(false);
    h.modem.push(&modem(), inbound(2, "+12125550100", "later"));
    h.message_added(&sms_path(2)).await;
    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    h.call(|c| c.is_delete_of(&sms_path(2))).await;
    assert_eq!(h.count(|c| persisted_body(c, "keep me")), 2);
}

#[tokio::test(start_paused = true)]
async fn entries_that_are_not_inbound_messages_are_left_alone() {
    let outbound = SmsEntry {
        state: SmsState::Sent,
        pdu: PduKind::Submit,
        ..inbound(3, "+12125550100", "outbound")
    };
    let stored_draft = SmsEntry {
        state: SmsState::Stored,
        pdu: PduKind::Submit,
        ..inbound(4, "+12125550100", "draft")
    };
    let unknown = SmsEntry {
        pdu: PduKind::Unknown(9),
        ..inbound(5, "+12125550100", "mystery")
    };
    let cdma = SmsEntry {
        pdu: PduKind::CdmaDeliver,
        ..inbound(6, "+12125550100", "cdma")
    };
    let mut h = Harness::start(
        Setup::with_modem()
            .entry(outbound)
            .entry(stored_draft)
            .entry(unknown)
            .entry(cdma),
    );

    h.call(|c| c.is_delete_of(&sms_path(6))).await;
    h.settle().await;

    for n in [3, 4, 5] {
        assert!(h.modem.contains(&sms_path(n)), "entry {n} was touched");
    }
    assert_eq!(h.count(|c| matches!(c, Call::Persist { .. })), 1);
    let messages = h.handle.messages("+12125550100").await.expect("chat exists");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "cdma");
}

#[tokio::test(start_paused = true)]
async fn overlapping_listings_store_a_message_once() {
    let mut h = Harness::start(Setup::with_modem().entry(inbound(1, "+12125550100", "once")));
    h.modem.gate_deletes();

    h.call(|c| c.is_delete_of(&sms_path(1))).await;

    // a second listing while the delete is outstanding
    h.message_added(&sms_path(1)).await;
    h.call(|c| matches!(c, Call::Read(p) if *p == sms_path(1))).await;
    h.call(|c| matches!(c, Call::Read(p) if *p == sms_path(1))).await;
    h.settle().await;

    h.modem.release_deletes();
    h.settle().await;

    assert_eq!(h.count(|c| persisted_body(c, "once")), 1);
    assert_eq!(h.count(|c| c.is_delete_of(&sms_path(1))), 1);
    let messages = h.handle.messages("+12125550100").await.expect("chat exists");
    assert_eq!(messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn locally_created_and_foreign_entries_do_not_trigger_a_listing() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.settle().await;
    let listings = h.count(|c| matches!(c, Call::List(_)));

    h.signal(TransportEvent::MessageAdded {
        device: modem(),
        sms: sms_path(1),
        received: false,
    })
    .await;
    h.signal(TransportEvent::MessageAdded {
        device: DevicePath("/org/freedesktop/ModemManager1/Modem/9".to_owned()),
        sms: sms_path(2),
        received: true,
    })
    .await;
    h.settle().await;

    assert_eq!(h.count(|c| matches!(c, Call::List(_))), listings);
}

#[tokio::test(start_paused = true)]
async fn path_reused_after_a_listing_is_read_again() {
    let mut h = Harness::start(Setup::with_modem().entry(inbound(1, "+12125550100", "first")));
    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    h.settle().await;

    // this listing no longer shows entry 1
    h.modem.push(&modem(), inbound(2, "+12125550100", "second"));
    h.message_added(&sms_path(2)).await;
    h.call(|c| c.is_delete_of(&sms_path(2))).await;

    h.modem.push(&modem(), inbound(1, "+12125550100", "reused"));
    h.message_added(&sms_path(1)).await;
    h.call(|c| persisted_body(c, "reused")).await;
    h.call(|c| c.is_delete_of(&sms_path(1))).await;

    let messages = h.handle.messages("+12125550100").await.expect("chat exists");
    let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["first", "second", "reused"]);
}
