use std::time::Duration;

use chrono::Utc;
use scrumflow_client::transport::MemoryTransport;
use scrumflow_client::{ClientConfig, CollaborationContext};
use scrumflow_common::channel::ChannelConfig;
use scrumflow_common::realtime::RealtimeHub;
use scrumflow_common::types::{PresenceStatus, UserPresence};
use uuid::Uuid;

async fn context(hub: &RealtimeHub) -> CollaborationContext {
    CollaborationContext::new(MemoryTransport::connect(hub.clone()).await, ClientConfig::default())
}

async fn wait_for_members(hub: &RealtimeHub, topic: &str, expected: usize) {
    for _ in 0..100 {
        if hub.topic_members(topic).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{topic} never reached {expected} members");
}

fn presence(user_id: Uuid, project_id: Uuid) -> UserPresence {
    UserPresence {
        user_id,
        user_name: "Quiet Quinn".into(),
        status: PresenceStatus::Idle,
        last_seen: Utc::now(),
        project_id: Some(project_id),
        current_page: None,
        cursor: None,
        selection: None,
    }
}

#[tokio::test]
async fn quiet_connected_user_survives_sweeps_until_the_channel_closes() {
    let hub = RealtimeHub::new();
    let (watcher, tracked) = (context(&hub).await, context(&hub).await);
    let project_id = Uuid::new_v4();
    let config = ChannelConfig::ProjectUpdates { project_id };

    let watching = watcher.registry().subscribe(config, |_| {}).unwrap();
    let _tracking = tracked.registry().subscribe(config, |_| {}).unwrap();
    wait_for_members(&hub, &config.canonical_id(), 2).await;

    let user = Uuid::new_v4();
    assert!(tracked.track_presence(project_id, presence(user, project_id)));
    for _ in 0..100 {
        if watcher.presence().get(user).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(watcher.presence().get(user).await.is_some());

    let much_later = Utc::now() + chrono::Duration::minutes(6);
    let report = watcher.sweep(much_later).await;
    assert_eq!(report.presence, 0);
    assert!(watcher.presence().get(user).await.is_some());

    // Once the channel is gone no leave can arrive, so the stale entry goes.
    assert!(watching.unsubscribe());
    let report = watcher.sweep(much_later).await;
    assert_eq!(report.presence, 1);
    assert!(watcher.presence().get(user).await.is_none());
}
