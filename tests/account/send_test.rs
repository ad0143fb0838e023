//! Tests for `src/account/send.rs`: the outbound SMS chain and its failures.

use std::time::Duration;

use cellchat::chat::{Direction, MessageStatus};
use cellchat::modem::{CreateRequest, DeliveryState};
use cellchat::{AccountError, AccountNotice};

use crate::support::{modem, sms_path, status_report, Call, Harness, Setup};

#[tokio::test(start_paused = true)]
async fn sent_message_is_deleted_before_it_is_persisted() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.modem.script_references(&[7]);

    let id = h
        .handle
        .send_message("+1 (212) 555-0100", "Hello")
        .await
        .expect("send accepted");

    let create = h.call(|c| matches!(c, Call::Create(_))).await;
    assert_eq!(
        create,
        Call::Create(CreateRequest {
            text: "Hello".to_owned(),
            number: "+12125550100".to_owned(),
            delivery_report: true,
            validity: 10080,
        })
    );

    let sent = sms_path(100);
    h.call(|c| *c == Call::Send(sent.clone())).await;
    h.call(|c| *c == Call::Reference(sent.clone())).await;
    h.call(|c| c.is_delete_of(&sent)).await;
    h.call(|c| c.is_persist_with(MessageStatus::Sent)).await;

    let deleted = h.position(|c| c.is_delete_of(&sent));
    let persisted = h.position(|c| c.is_persist_with(MessageStatus::Sent));
    assert!(deleted < persisted, "persisted before the queue entry was deleted");
    assert!(!h.modem.contains(&sent));

    assert_eq!(h.handle.pending_references().await.expect("running"), vec![7]);
    assert_eq!(
        h.statuses(id),
        vec![
            MessageStatus::Draft,
            MessageStatus::Sending,
            MessageStatus::Sent,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn delivery_report_completes_the_message() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.modem.script_references(&[42]);

    let id = h
        .handle
        .send_message("+12125550100", "Hello")
        .await
        .expect("send accepted");
    h.call(|c| c.is_persist_with(MessageStatus::Sent)).await;

    let report = status_report(7, 42, DeliveryState::Completed(0));
    h.modem.push(&modem(), report);
    h.message_added(&sms_path(7)).await;

    h.call(|c| c.is_persist_with(MessageStatus::Delivered)).await;
    h.call(|c| c.is_delete_of(&sms_path(7))).await;

    let messages = h.handle.messages("+12125550100").await.expect("chat exists");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Delivered);
    assert_eq!(messages[0].direction, Direction::Out);
    assert!(messages[0].delivered_at.is_some());
    assert!(h.handle.pending_references().await.expect("running").is_empty());
    assert_eq!(h.statuses(id).last(), Some(&MessageStatus::Delivered));
}

#[tokio::test(start_paused = true)]
async fn zero_reference_is_read_again_after_a_pause() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.modem.script_references(&[0, 7]);
    h.modem.gate_deletes();

    let started = tokio::time::Instant::now();
    h.handle
        .send_message("+12125550100", "Hello")
        .await
        .expect("send accepted");

    let sent = sms_path(100);
    h.call(|c| *c == Call::Reference(sent.clone())).await;
    h.call(|c| *c == Call::Reference(sent.clone())).await;
    assert!(started.elapsed() >= Duration::from_secs(3));

    // the reference is registered while the delete is still outstanding
    h.call(|c| c.is_delete_of(&sent)).await;
    h.settle().await;
    assert_eq!(h.handle.pending_references().await.expect("running"), vec![7]);
    assert_eq!(h.count(|c| matches!(c, Call::Persist { .. })), 0);

    h.modem.release_deletes();
    h.call(|c| c.is_persist_with(MessageStatus::Sent)).await;
}

#[tokio::test(start_paused = true)]
async fn reference_that_stays_unknown_is_not_tracked() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;

    h.handle
        .send_message("+12125550100", "Hello")
        .await
        .expect("send accepted");

    h.call(|c| c.is_persist_with(MessageStatus::Sent)).await;
    assert_eq!(h.count(|c| matches!(c, Call::Reference(_))), 2);
    assert!(h.handle.pending_references().await.expect("running").is_empty());
}

#[tokio::test(start_paused = true)]
async fn stored_notice_marks_the_end_of_the_send_chain() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.modem.script_references(&[0, 7]);
    let mut notices = h.handle.subscribe();

    let id = h
        .handle
        .send_message("+12125550100", "Hello")
        .await
        .expect("send accepted");

    let stored = loop {
        match notices.recv().await.expect("account running") {
            AccountNotice::MessageStored {
                message,
                status,
                saved,
                ..
            } if message == id => break (status, saved),
            _ => {}
        }
    };
    assert_eq!(stored, (MessageStatus::Sent, true));

    // shutting down right away loses nothing
    h.handle.shutdown().await.expect("first shutdown");
    assert!(!h.modem.contains(&sms_path(100)));
    assert_eq!(h.count(|c| c.is_delete_of(&sms_path(100))), 1);
    assert_eq!(h.count(|c| c.is_persist_with(MessageStatus::Sent)), 1);
    h.task.await.expect("account task finished");
}

#[tokio::test(start_paused = true)]
async fn invalid_number_is_recorded_as_failed() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;

    let err = h.handle.send_message("call-me!", "hi").await.expect_err("request should fail");
    assert_eq!(err, AccountError::InvalidNumber("call-me!".to_owned()));

    h.call(|c| c.is_persist_with(MessageStatus::SendFailed)).await;
    assert_eq!(h.count(|c| matches!(c, Call::Create(_))), 0);
    assert_eq!(h.notifier.failed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn blank_recipients_create_nothing() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;

    let err = h.handle.send_message(" , ", "hi").await.expect_err("request should fail");
    assert!(matches!(err, AccountError::InvalidNumber(_)));
    h.settle().await;

    // no chat to hold it, so no failed message is recorded either
    assert!(h.handle.chats().await.expect("running").is_empty());
    assert_eq!(h.count(|c| matches!(c, Call::Persist { .. })), 0);
    assert_eq!(h.count(|c| matches!(c, Call::Create(_))), 0);
    assert!(h.notifier.failed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_text_is_rejected() {
    let h = Harness::start(Setup::with_modem());
    h.connected().await;

    let err = h.handle.send_message("+12125550100", "   ").await.expect_err("request should fail");
    assert_eq!(err, AccountError::EmptyMessage);
}

#[tokio::test(start_paused = true)]
async fn sending_without_a_modem_fails() {
    let mut h = Harness::start(Setup::new());
    h.settle().await;

    let err = h.handle.send_message("+12125550100", "hi").await.expect_err("request should fail");
    assert_eq!(err, AccountError::NoModem);

    h.call(|c| c.is_persist_with(MessageStatus::SendFailed)).await;
    let messages = h.handle.messages("+12125550100").await.expect("chat kept");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::SendFailed);
}

#[tokio::test(start_paused = true)]
async fn rejected_send_removes_the_created_entry() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.modem.fail_send("network busy");

    let id = h
        .handle
        .send_message("+12125550100", "Hello")
        .await
        .expect("handed to modem");

    let created = sms_path(100);
    h.call(|c| c.is_persist_with(MessageStatus::SendFailed)).await;
    h.call(|c| c.is_delete_of(&created)).await;
    h.settle().await;

    assert!(!h.modem.contains(&created));
    assert_eq!(h.count(|c| matches!(c, Call::Reference(_))), 0);
    assert_eq!(h.statuses(id).last(), Some(&MessageStatus::SendFailed));
    assert_eq!(
        h.notifier.failed(),
        vec![(
            "+12125550100".to_owned(),
            "modem rejected request: network busy".to_owned()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn create_failure_fails_the_message() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;
    h.modem.fail_create("queue full");

    h.handle
        .send_message("+12125550100", "Hello")
        .await
        .expect("handed to modem");

    h.call(|c| c.is_persist_with(MessageStatus::SendFailed)).await;
    assert_eq!(h.count(|c| matches!(c, Call::Send(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn own_number_is_dropped_from_recipients() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;

    h.handle
        .send_message("+15550009999, (212) 555-0100", "Hello")
        .await
        .expect("send accepted");

    let create = h.call(|c| matches!(c, Call::Create(_))).await;
    let Call::Create(request) = create else {
        unreachable!()
    };
    assert_eq!(request.number, "+12125550100");
    assert!(h
        .handle
        .find_chat("+12125550100")
        .await
        .expect("running")
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn group_send_without_mms_service_fails() {
    let mut h = Harness::start(Setup::with_modem());
    h.connected().await;

    let err = h
        .handle
        .send_message("+12125550100,+12125550101", "hi all")
        .await
        .expect_err("request should fail");
    assert_eq!(err, AccountError::MmsUnavailable);

    h.call(|c| c.is_persist_with(MessageStatus::SendFailed)).await;
    let chat = h
        .handle
        .find_chat("+12125550101, +12125550100")
        .await
        .expect("running")
        .expect("group chat recorded");
    assert_eq!(chat.key, "+12125550100,+12125550101");
    assert_eq!(h.count(|c| matches!(c, Call::Create(_))), 0);
}
