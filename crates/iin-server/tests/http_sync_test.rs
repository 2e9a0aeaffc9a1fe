//! Agents talking to each other over real HTTP on loopback.

mod common;

use common::{direct_client, id, wait_for, Cluster};
use iin_protocol::RunEvent;
use iin_types::{Ack, Membership};
use serde_json::{json, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_over_http_records_counter_attested_membership() {
    let cluster = Cluster::start(&[
        ("network1", &["Org1MSP", "Org4MSP"][..]),
        ("network2", &["Org2MSP", "Org3MSP"][..]),
    ])
    .await;
    let initiator = cluster.get("network1", "Org1MSP");
    let mut events = initiator.agent.subscribe();
    let client = direct_client();

    let ack: Ack = client
        .post(format!("{}/iin/v1/SyncExternalState", initiator.base_url))
        .json(&json!({"securityDomain": "network2", "memberId": ""}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ack.is_ok(), "{ack:?}");
    let nonce = ack.request_id;

    let recorded = wait_for(&mut events, |e| {
        matches!(
            e,
            RunEvent::MembershipRecorded { .. } | RunEvent::RunFailed { .. }
        )
    })
    .await;
    assert_eq!(
        recorded,
        RunEvent::MembershipRecorded {
            nonce: nonce.clone(),
            security_domain: "network2".into()
        }
    );
    cluster.settle().await;

    let stored = iin_db::get_foreign_membership(&initiator.pool.get().unwrap(), "network2")
        .unwrap()
        .unwrap();
    assert_eq!(stored.nonce, nonce);
    assert_eq!(stored.version, 1);
    let signers: Vec<_> = stored
        .counter_attested
        .attestations
        .iter()
        .filter_map(|a| a.member_id())
        .collect();
    assert_eq!(signers, ["Org1MSP", "Org4MSP"]);
    let mut members: Vec<_> = stored.membership.members.keys().cloned().collect();
    members.sort();
    assert_eq!(members, ["Org2MSP", "Org3MSP"]);

    // The record is served over the read endpoint too.
    let served: Value = client
        .get(format!("{}/iin/v1/memberships/network2", initiator.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(served["securityDomain"], "network2");
    assert_eq!(served["version"], 1);
    let decoded: Membership = serde_json::from_value(served["membership"].clone()).unwrap();
    assert_eq!(decoded, stored.membership);

    // The counter-attesting peer refreshed its cache with both foreign agents.
    let peer = cluster.get("network1", "Org4MSP");
    assert!(peer.agent.cache().get(&id("network2", "Org2MSP")).is_some());
    assert!(peer.agent.cache().get(&id("network2", "Org3MSP")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_sync_bumps_the_recorded_version() {
    let cluster = Cluster::start(&[
        ("network1", &["Org1MSP"][..]),
        ("network2", &["Org2MSP"][..]),
    ])
    .await;
    let initiator = cluster.get("network1", "Org1MSP");
    let mut events = initiator.agent.subscribe();

    for _ in 0..2 {
        initiator
            .agent
            .sync_external_state(&id("network2", ""))
            .unwrap();
        let event = wait_for(&mut events, |e| {
            matches!(
                e,
                RunEvent::MembershipRecorded { .. } | RunEvent::RunFailed { .. }
            )
        })
        .await;
        assert!(matches!(event, RunEvent::MembershipRecorded { .. }), "{event:?}");
        cluster.settle().await;
    }

    let conn = initiator.pool.get().unwrap();
    let history = iin_db::membership_history(&conn, "network2").unwrap();
    assert_eq!(
        history.iter().map(|h| h.version).collect::<Vec<_>>(),
        [1, 2]
    );
    assert_ne!(history[0].nonce, history[1].nonce);
}
