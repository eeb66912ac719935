mod common;

use common::{
    complete_bootstrap, session_with, test_device, MockLink, CONNECTIONLESS_CAPABILITIES, NODE_ID,
    RADIO_CAPABILITIES, RESTRICTED_CAPABILITIES,
};
use mesh_core::codec::InboundFrame;
use mesh_core::types::{
    Annotation, AnnotationKind, ConfigDownloadStep, ConnectionState, GeoPoint, Peer, StatusUpdate,
};
use mesh_core::{MeshError, MeshProtocol, SyncFields};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn annotation(points: usize) -> Annotation {
    Annotation {
        id: Uuid::new_v4(),
        origin: String::new(),
        seq: 0,
        kind: AnnotationKind::Line,
        color: "#ff8800".to_string(),
        points: (0..points)
            .map(|i| GeoPoint {
                latitude: 40.0 + i as f64 * 0.001,
                longitude: -75.0 - i as f64 * 0.001,
            })
            .collect(),
        status: None,
    }
}

#[tokio::test]
async fn test_connect_sends_handshake_then_bootstrap_completes() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);

    session.connect_to_device(test_device()).await.unwrap();

    let frames = link.outbound_frames();
    assert!(matches!(frames[0], InboundFrame::Handshake(_)));

    let mut step = session.config_download_step();
    complete_bootstrap(&link).await;
    timeout(WAIT, step.wait_for(|s| *s == ConfigDownloadStep::Complete))
        .await
        .expect("bootstrap never completed")
        .unwrap();

    let mut state = session.connection_state();
    timeout(
        WAIT,
        state.wait_for(|s| matches!(s, ConnectionState::ServiceConnected(_))),
    )
    .await
    .expect("never reached service-connected")
    .unwrap();

    let counters = *session.config_step_counters().borrow();
    assert_eq!(counters.config, 1);
    assert_eq!(counters.my_info, 1);
}

#[tokio::test]
async fn test_connect_failure_lands_in_error_state_and_stays_retryable() {
    let link = MockLink::new();
    link.set_fail_connect(true);
    let session = session_with(link.clone(), RADIO_CAPABILITIES);

    let result = session.connect_to_device(test_device()).await;
    assert!(result.is_err());

    assert!(matches!(
        *session.connection_state().borrow(),
        ConnectionState::Error(_)
    ));
    assert!(session.is_ready_for_new_connection());

    // A later attempt is allowed once the link recovers.
    link.set_fail_connect(false);
    session.connect_to_device(test_device()).await.unwrap();
    assert!(session.connection_state().borrow().is_connected());
}

#[tokio::test]
async fn test_connect_while_connected_is_rejected() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);

    session.connect_to_device(test_device()).await.unwrap();
    let result = session.connect_to_device(test_device()).await;
    assert!(matches!(result, Err(MeshError::NotReady(_))));
}

#[tokio::test]
async fn test_link_loss_disconnects_and_resets_bootstrap() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);

    session.connect_to_device(test_device()).await.unwrap();
    complete_bootstrap(&link).await;

    let mut state = session.connection_state();
    timeout(
        WAIT,
        state.wait_for(|s| matches!(s, ConnectionState::ServiceConnected(_))),
    )
    .await
    .expect("never reached service-connected")
    .unwrap();

    link.drop_link();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .expect("link loss not observed")
        .unwrap();
    assert_eq!(
        *session.config_download_step().borrow(),
        ConfigDownloadStep::NotStarted
    );

    // Reconnecting restarts the bootstrap from the handshake.
    session.connect_to_device(test_device()).await.unwrap();
    assert_eq!(
        *session.config_download_step().borrow(),
        ConfigDownloadStep::WaitingForConfig
    );
    complete_bootstrap(&link).await;
    let mut step = session.config_download_step();
    timeout(WAIT, step.wait_for(|s| *s == ConfigDownloadStep::Complete))
        .await
        .expect("second bootstrap never completed")
        .unwrap();
}

#[tokio::test]
async fn test_send_text_message_writes_frame_and_appends_locally() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let channel = session.create_channel("Ops").await.unwrap();
    session.send_text_message(channel.id, "moving out").await.unwrap();

    let text = link
        .outbound_frames()
        .into_iter()
        .find_map(|f| match f {
            InboundFrame::Text(t) => Some(t),
            _ => None,
        })
        .expect("no text frame written");
    assert_eq!(text.channel_id, Some(channel.id));
    assert_eq!(text.sender, NODE_ID);
    assert!(!text.pki_encrypted);

    let log = session.channel_messages(channel.id).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].content, "moving out");
}

#[tokio::test]
async fn test_sends_require_connection_when_capability_says_so() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);

    let default_channel = session.channels().await[0].id;
    let result = session.send_text_message(default_channel, "hello").await;
    assert!(result.is_err());
    assert_eq!(link.outbound_count(), 0);
}

#[tokio::test]
async fn test_connectionless_transport_sends_without_connecting() {
    let link = MockLink::new();
    // Writes go straight to the shared segment; no connect step is needed.
    let session = session_with(link.clone(), CONNECTIONLESS_CAPABILITIES);

    let default_channel = session.channels().await[0].id;
    session.send_text_message(default_channel, "anyone out there").await.unwrap();
    assert_eq!(link.outbound_count(), 1);
}

#[tokio::test]
async fn test_direct_message_blocked_until_peer_key_resolves() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let bob = "bob".to_string();
    let dm = session.get_or_create_direct_message_channel(&bob).await.unwrap();
    assert!(dm.is_direct_message);

    // No key resolved yet: the send must fail rather than fall back to plaintext.
    let result = session.send_direct_message(&bob, "secret").await;
    assert!(matches!(result, Err(MeshError::PkiNotReady(_))));

    link.inject(InboundFrame::NodeInfo(mesh_core::codec::NodeInfoFrame {
        peer: Peer {
            id: bob.clone(),
            nickname: "bob".to_string(),
            long_name: "Bob".to_string(),
            last_seen: chrono::Utc::now(),
            has_public_key: true,
            public_key: Some(vec![1, 2, 3, 4]),
        },
    }))
    .await;

    // Wait until the ingest loop has processed the node info.
    timeout(WAIT, async {
        loop {
            if session.peers().await.iter().any(|p| p.id == bob && p.has_public_key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("node info never ingested");

    session.send_direct_message(&bob, "secret").await.unwrap();

    let text = link
        .outbound_frames()
        .into_iter()
        .rev()
        .find_map(|f| match f {
            InboundFrame::Text(t) => Some(t),
            _ => None,
        })
        .expect("no text frame written");
    assert_eq!(text.recipient, Some(bob.clone()));
    assert!(text.pki_encrypted);
    assert_eq!(text.recipient_key, Some(vec![1, 2, 3, 4]));

    // The message also lands in the local DM log.
    assert_eq!(session.channel_messages(dm.id).await.len(), 1);
}

#[tokio::test]
async fn test_text_message_on_dm_channel_goes_through_direct_path() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let bob = "bob".to_string();
    let dm = session.get_or_create_direct_message_channel(&bob).await.unwrap();

    // The DM channel has no resolved key, so even the channel-addressed form fails.
    let result = session.send_text_message(dm.id, "secret").await;
    assert!(matches!(result, Err(MeshError::PkiNotReady(_))));
}

#[tokio::test]
async fn test_channel_management_gated_by_capability() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RESTRICTED_CAPABILITIES);

    assert!(matches!(
        session.create_channel("Ops").await,
        Err(MeshError::InvalidChannelOperation(_))
    ));
    let default_channel = session.channels().await[0].id;
    assert!(matches!(
        session.delete_channel(default_channel).await,
        Err(MeshError::InvalidChannelOperation(_))
    ));
}

#[tokio::test]
async fn test_oversized_annotation_rejected_before_any_state_change() {
    let link = MockLink::new();
    link.set_max_payload(128);
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let reported = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let reported_cb = std::sync::Arc::clone(&reported);
    session
        .set_packet_too_large_callback(Box::new(move |_, _| {
            reported_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }))
        .await;

    let written_before = link.outbound_count();
    let result = session.send_annotation(annotation(50)).await;
    assert!(matches!(result, Err(MeshError::OversizedPayload { .. })));

    // Nothing was stored, nothing was written, and the UI was told why.
    assert!(session.annotations().await.is_empty());
    assert_eq!(link.outbound_count(), written_before);
    assert_eq!(reported.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sent_annotation_gets_local_seq_and_origin() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let mut first = annotation(2);
    first.origin = "spoofed".to_string();
    let id = first.id;
    session.send_annotation(first).await.unwrap();

    let stored = session.annotations().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].origin, NODE_ID);
    assert_eq!(stored[0].seq, 1);

    // Re-sending the same id bumps the sequence number past the stored copy.
    let mut second = annotation(2);
    second.id = id;
    session.send_annotation(second).await.unwrap();
    let stored = session.annotations().await;
    assert_eq!(stored[0].seq, 2);
}

#[tokio::test]
async fn test_bulk_deletion_applies_locally_and_writes_frame() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let note = annotation(1);
    let id = note.id;
    session.send_annotation(note).await.unwrap();
    session.send_bulk_annotation_deletions(&[id]).await.unwrap();

    assert!(session.annotations().await.is_empty());
    let delete = link
        .outbound_frames()
        .into_iter()
        .find_map(|f| match f {
            InboundFrame::AnnotationDelete(d) => Some(d),
            _ => None,
        })
        .expect("no deletion frame written");
    assert_eq!(delete.ids, vec![id]);
    assert_eq!(delete.origin, NODE_ID);
}

#[tokio::test]
async fn test_deleted_annotation_resend_is_not_broadcast() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let note = annotation(1);
    let id = note.id;
    session.send_annotation(note).await.unwrap();
    session.send_bulk_annotation_deletions(&[id]).await.unwrap();

    // Re-sending a tombstoned id succeeds quietly but must not reach the
    // wire: peers would resurrect an annotation we no longer hold.
    let written_before = link.outbound_count();
    let mut resend = annotation(1);
    resend.id = id;
    session.send_annotation(resend).await.unwrap();

    assert_eq!(link.outbound_count(), written_before);
    assert!(session.annotations().await.is_empty());
}

#[tokio::test]
async fn test_location_update_skipped_when_transport_sources_location() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RESTRICTED_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let written_before = link.outbound_count();
    session.send_location_update(40.0, -75.0).await.unwrap();
    assert_eq!(link.outbound_count(), written_before);
}

#[tokio::test]
async fn test_location_updates_carry_increasing_sequence() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    session.send_location_update(40.0, -75.0).await.unwrap();
    session.send_location_update(40.1, -75.1).await.unwrap();

    let seqs: Vec<u64> = link
        .outbound_frames()
        .into_iter()
        .filter_map(|f| match f {
            InboundFrame::Position(p) => Some(p.seq),
            _ => None,
        })
        .collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn test_status_update_is_stamped_with_own_node_id() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    session
        .send_status_update(StatusUpdate {
            peer_id: "forged".to_string(),
            emergency: true,
            battery_percent: Some(40),
            message: None,
        })
        .await
        .unwrap();

    let status = link
        .outbound_frames()
        .into_iter()
        .find_map(|f| match f {
            InboundFrame::Status(s) => Some(s.status),
            _ => None,
        })
        .expect("no status frame written");
    assert_eq!(status.peer_id, NODE_ID);
    assert!(status.emergency);
}

#[tokio::test]
async fn test_partial_state_sync_with_no_fields_is_rejected() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let result = session.send_state_sync(None, SyncFields::none(), true).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_full_state_sync_carries_every_field() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();
    session.send_annotation(annotation(1)).await.unwrap();

    // Full sync ignores the field selection entirely.
    session
        .send_state_sync(Some("bob".to_string()), SyncFields::none(), false)
        .await
        .unwrap();

    let sync = link
        .outbound_frames()
        .into_iter()
        .find_map(|f| match f {
            InboundFrame::StateSync(s) => Some(s),
            _ => None,
        })
        .expect("no state sync frame written");
    assert!(!sync.partial);
    assert_eq!(sync.target, Some("bob".to_string()));
    assert_eq!(sync.origin, NODE_ID);
    assert!(sync.channels.is_some());
    assert!(sync.peer_locations.is_some());
    assert_eq!(sync.annotations.as_ref().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_diagnostic_info_reflects_session_state() {
    let link = MockLink::new();
    let session = session_with(link.clone(), RADIO_CAPABILITIES);
    session.connect_to_device(test_device()).await.unwrap();

    let info = session.diagnostic_info().await;
    assert_eq!(info.connection_state, "connected");
    assert_eq!(info.bootstrap_step, "waiting_for_config");
    assert_eq!(info.generation, 1);
    assert_eq!(info.channel_count, 1);
}
