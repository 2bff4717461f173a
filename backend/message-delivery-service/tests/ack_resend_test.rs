mod common;

use chrono::{Duration, Utc};
use common::{drain_frames, text_request, Harness};
use message_delivery_service::models::{AckItem, AckStatus};
use uuid::Uuid;

#[tokio::test]
async fn test_unacked_push_resent_up_to_limit_then_failed() {
    let h = Harness::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = h.conversation(&[alice, bob]);
    let (_conn, mut bob_rx) = h.connect(bob, "phone").await;

    let msg = h
        .messages
        .send_message(text_request(conv, alice, "c-1", "ack me"))
        .await
        .unwrap();
    h.relay_outbox().await;
    assert_eq!(drain_frames(&mut bob_rx).len(), 1);
    assert_eq!(h.acks.count(bob).await.unwrap(), 1);

    let start = Utc::now();
    let early = h.acks.resend_due(start).await.unwrap();
    assert_eq!((early.resent, early.failed), (0, 0));

    for attempt in 1..=3 {
        let now = start + Duration::seconds(31 * attempt);
        let report = h.acks.resend_due(now).await.unwrap();
        assert_eq!((report.resent, report.failed), (1, 0), "attempt {attempt}");

        let frames = drain_frames(&mut bob_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "message_resend");
        assert_eq!(frames[0]["data"]["message_id"], msg.id.to_string());
        assert_eq!(frames[0]["data"]["seq"], 1);
        assert_eq!(
            h.pending_acks.item(bob, msg.id).unwrap().retry_count,
            attempt as i32
        );
    }

    let exhausted = h
        .acks
        .resend_due(start + Duration::seconds(31 * 4))
        .await
        .unwrap();
    assert_eq!((exhausted.resent, exhausted.failed), (0, 1));
    assert_eq!(
        h.pending_acks.item(bob, msg.id).unwrap().status,
        AckStatus::Failed
    );
    assert_eq!(h.acks.count(bob).await.unwrap(), 0);

    let after = h
        .acks
        .resend_due(start + Duration::seconds(31 * 10))
        .await
        .unwrap();
    assert_eq!((after.resent, after.failed), (0, 0));
    assert!(drain_frames(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn test_ack_stops_resends() {
    let h = Harness::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = h.conversation(&[alice, bob]);
    let (_conn, mut bob_rx) = h.connect(bob, "phone").await;

    let msg = h
        .messages
        .send_message(text_request(conv, alice, "c-1", "hi"))
        .await
        .unwrap();
    h.relay_outbox().await;
    drain_frames(&mut bob_rx);

    assert!(h.acks.ack(bob, msg.id).await.unwrap());
    assert!(!h.acks.ack(bob, msg.id).await.unwrap());
    assert!(!h.acks.ack(bob, Uuid::new_v4()).await.unwrap());

    let report = h
        .acks
        .resend_due(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!((report.resent, report.failed), (0, 0));
    assert!(drain_frames(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn test_batch_ack_advances_read_watermark_per_conversation() {
    let h = Harness::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let first = h.conversation(&[alice, bob]);
    let second = h.conversation(&[alice, bob]);
    let (_conn, _bob_rx) = h.connect(bob, "phone").await;

    let mut items = Vec::new();
    for (i, conv) in [first, first, first, second].into_iter().enumerate() {
        let msg = h
            .messages
            .send_message(text_request(conv, alice, &format!("c-{i}"), "hi"))
            .await
            .unwrap();
        items.push(AckItem {
            conversation_id: conv,
            message_id: msg.id,
            seq: msg.seq,
        });
    }
    h.relay_outbox().await;
    assert_eq!(h.acks.count(bob).await.unwrap(), 4);

    // acknowledge out of order, leaving one message of the first conversation
    let acked = [items[2], items[0], items[3]];
    assert_eq!(h.acks.batch_ack(bob, &acked).await.unwrap(), 3);

    let pending = h.acks.pending(bob).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, items[1].message_id);

    assert_eq!(h.messages.get_unread_count(bob, first).await.unwrap(), 0);
    assert_eq!(h.messages.get_unread_count(bob, second).await.unwrap(), 0);
    assert_eq!(h.acks.batch_ack(bob, &[]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_resend_with_no_device_still_consumes_an_attempt() {
    let h = Harness::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = h.conversation(&[alice, bob]);
    let (conn, _bob_rx) = h.connect(bob, "phone").await;

    let msg = h
        .messages
        .send_message(text_request(conv, alice, "c-1", "hi"))
        .await
        .unwrap();
    h.relay_outbox().await;
    h.sessions.on_disconnect(bob, "phone", conn).await.unwrap();

    let report = h
        .acks
        .resend_due(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.resent, 1);
    assert_eq!(h.pending_acks.item(bob, msg.id).unwrap().retry_count, 1);
}
