//! Tests for group messages routed through the MMS delegate.

use chrono::Utc;

use cellchat::chat::{Direction, MessageStatus};
use cellchat::mms::{MmsEvent, MmsRequest};

use crate::support::{Call, Harness, Setup, OWN_NUMBER};

const GROUP: &str = "+12125550100,+12125550101";

fn with_mms() -> Setup {
    let mut setup = Setup::with_modem();
    setup.mms = true;
    setup
}

fn event(id: &str, uid: Option<String>, direction: Direction, status: MessageStatus) -> MmsEvent {
    MmsEvent {
        id: id.to_owned(),
        uid,
        sender: match direction {
            Direction::In => "(212) 555-0100".to_owned(),
            Direction::Out => OWN_NUMBER.to_owned(),
        },
        recipients: vec![
            OWN_NUMBER.to_owned(),
            "+12125550100".to_owned(),
            "+12125550101".to_owned(),
        ],
        direction,
        status,
        body: "group hello".to_owned(),
        timestamp: Utc::now(),
    }
}

async fn handed_to_delegate(h: &mut Harness) -> MmsRequest {
    match h.call(|c| matches!(c, Call::SendMms(_))).await {
        Call::SendMms(request) => request,
        other => panic!("expected an MMS request, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn group_send_is_handed_to_the_delegate() {
    let mut h = Harness::start(with_mms());
    h.connected().await;

    let id = h
        .handle
        .send_message("+12125550101, +12125550100", "group hello")
        .await
        .expect("send accepted");

    let request = handed_to_delegate(&mut h).await;
    assert_eq!(request.recipients, vec!["+12125550100", "+12125550101"]);
    assert_eq!(request.body, "group hello");
    assert_eq!(h.count(|c| matches!(c, Call::Create(_))), 0);

    h.mms_events
        .send(event("mms-1", Some(request.uid), Direction::Out, MessageStatus::Sent))
        .await
        .expect("account listening");
    h.call(|c| c.is_persist_with(MessageStatus::Sent)).await;
    h.call(|c| *c == Call::Ack("mms-1".to_owned())).await;

    let persisted = h.position(|c| c.is_persist_with(MessageStatus::Sent));
    let acked = h.position(|c| *c == Call::Ack("mms-1".to_owned()));
    assert!(persisted < acked);
    assert_eq!(
        h.statuses(id),
        vec![
            MessageStatus::Draft,
            MessageStatus::Sending,
            MessageStatus::Sent,
        ]
    );

    // the completion updated our message instead of adding another
    let messages = h.handle.messages(GROUP).await.expect("chat exists");
    assert_eq!(messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_mms_alerts_the_user() {
    let mut h = Harness::start(with_mms());
    h.connected().await;

    h.handle
        .send_message(GROUP, "group hello")
        .await
        .expect("send accepted");
    let request = handed_to_delegate(&mut h).await;

    h.mms_events
        .send(event(
            "mms-2",
            Some(request.uid),
            Direction::Out,
            MessageStatus::SendFailed,
        ))
        .await
        .expect("account listening");
    h.call(|c| *c == Call::Ack("mms-2".to_owned())).await;

    assert_eq!(
        h.notifier.failed(),
        vec![(GROUP.to_owned(), "MMS delivery failed".to_owned())]
    );
}

#[tokio::test(start_paused = true)]
async fn inbound_group_mms_lands_in_the_group_chat() {
    let mut h = Harness::start(with_mms());
    h.connected().await;

    h.mms_events
        .send(event("mms-3", None, Direction::In, MessageStatus::Received))
        .await
        .expect("account listening");
    h.call(|c| *c == Call::Ack("mms-3".to_owned())).await;

    let chats = h.handle.chats().await.expect("running");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].key, GROUP);
    assert_eq!(chats[0].unread_count, 1);

    let messages = h.handle.messages(GROUP).await.expect("chat exists");
    assert_eq!(messages[0].sender.as_deref(), Some("+12125550100"));
    assert_eq!(messages[0].direction, Direction::In);
}

#[tokio::test(start_paused = true)]
async fn unstored_mms_is_not_acknowledged() {
    let mut h = Harness::start(with_mms());
    h.connected().await;
    h.history.fail(true);

    h.mms_events
        .send(event("mms-4", None, Direction::In, MessageStatus::Received))
        .await
        .expect("account listening");
    h.call(|c| matches!(c, Call::Persist { .. })).await;
    h.settle().await;

    assert_eq!(h.count(|c| matches!(c, Call::Ack(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn late_completion_for_a_deleted_chat_is_dropped() {
    let mut h = Harness::start(with_mms());
    h.connected().await;

    h.handle
        .send_message(GROUP, "group hello")
        .await
        .expect("send accepted");
    let request = handed_to_delegate(&mut h).await;
    h.handle.delete_chat(GROUP).await.expect("chat exists");
    h.call(|c| *c == Call::DeleteChat(GROUP.to_owned())).await;

    h.mms_events
        .send(event("mms-5", Some(request.uid), Direction::Out, MessageStatus::Sent))
        .await
        .expect("account listening");
    h.call(|c| *c == Call::Ack("mms-5".to_owned())).await;

    assert!(h.handle.chats().await.expect("running").is_empty());
    assert_eq!(h.count(|c| matches!(c, Call::Persist { .. })), 0);
}
