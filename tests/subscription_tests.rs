mod common;

use common::{test_config, Harness};
use sbn::bus::{SubscriptionReport, SUB_ENTRIES_PER_PKT};
use sbn::msgids::EVS_EVENT_MSG_MID;
use sbn::wire::{unpack_sub, MsgId, MsgType, Qos};
use sbn::{BusMessage, EngineConfig, SenderId, SoftwareBus};

fn connected(config: EngineConfig) -> Harness {
    let mut h = Harness::with_config(config, &[("CPU2", 2)]);
    h.engine.tick(0);
    h.connect("CPU2", 2, 1);
    h
}

fn sent_ids(h: &Harness, msg_type: MsgType) -> Vec<MsgId> {
    h.take_sent_of("CPU2", msg_type)
        .iter()
        .map(|f| unpack_sub(&f.payload).unwrap().0)
        .collect()
}

#[test]
fn only_first_subscribe_and_last_unsubscribe_reach_peers() {
    let mut h = connected(test_config());
    let a = h.app_pipe("A");
    let b = h.app_pipe("B");

    h.bus.subscribe(0x0902, a).unwrap();
    h.bus.subscribe(0x0902, b).unwrap();
    h.engine.tick(2);
    assert_eq!(sent_ids(&h, MsgType::Subscribe), vec![0x0902]);
    assert_eq!(h.engine.local_subs().get(0x0902).unwrap().in_use_ctr, 2);

    h.bus.unsubscribe(0x0902, a).unwrap();
    h.engine.tick(3);
    assert!(sent_ids(&h, MsgType::Unsubscribe).is_empty());
    assert_eq!(h.engine.local_subs().get(0x0902).unwrap().in_use_ctr, 1);

    h.bus.unsubscribe(0x0902, b).unwrap();
    h.engine.tick(4);
    assert_eq!(sent_ids(&h, MsgType::Unsubscribe), vec![0x0902]);
    assert!(h.engine.local_subs().is_empty());
}

#[test]
fn resubscribing_the_same_pipe_counts_once() {
    let mut h = connected(test_config());
    let a = h.app_pipe("A");

    h.bus.subscribe(0x0902, a).unwrap();
    h.bus.subscribe(0x0902, a).unwrap();
    h.engine.tick(2);
    assert_eq!(sent_ids(&h, MsgType::Subscribe), vec![0x0902]);
    assert_eq!(h.engine.local_subs().get(0x0902).unwrap().in_use_ctr, 1);

    h.bus.unsubscribe(0x0902, a).unwrap();
    h.engine.tick(3);
    assert!(h.bus.subscribers(0x0902).is_empty());
    assert!(h.engine.local_subs().get(0x0902).is_none());
    assert_eq!(sent_ids(&h, MsgType::Unsubscribe), vec![0x0902]);
}

#[test]
fn announcing_peers_are_not_told_about_new_subscriptions() {
    let mut h = Harness::new(&[("CPU2", 2)]);
    h.engine.tick(0);
    let app = h.app_pipe("APP");
    h.bus.subscribe(0x0907, app).unwrap();
    h.engine.tick(1);

    assert_eq!(h.engine.local_subs().len(), 1);
    assert!(h.take_sent_of("CPU2", MsgType::Subscribe).is_empty());
}

#[test]
fn peer_subscribe_is_idempotent() {
    let mut h = connected(test_config());

    h.inject_sub(2, MsgType::Subscribe, 0x0903);
    h.inject_sub(2, MsgType::Subscribe, 0x0903);
    h.engine.tick(2);
    assert_eq!(h.engine.peers().get(0).unwrap().sub_count(), 1);
    assert_eq!(h.bus.subscribers(0x0903).len(), 1);

    h.inject_sub(2, MsgType::Unsubscribe, 0x0903);
    h.inject_sub(2, MsgType::Unsubscribe, 0x0903);
    h.engine.tick(3);
    assert_eq!(h.engine.peers().get(0).unwrap().sub_count(), 0);
    assert!(h.bus.subscribers(0x0903).is_empty());
}

#[test]
fn peer_subscription_table_is_bounded() {
    let config = EngineConfig { max_subs_per_peer: 2, ..test_config() };
    let mut h = connected(config);

    for msg_id in [0x0A00, 0x0A01, 0x0A02] {
        h.inject_sub(2, MsgType::Subscribe, msg_id);
    }
    h.engine.tick(2);

    let peer = h.engine.peers().get(0).unwrap();
    assert_eq!(peer.sub_count(), 2);
    assert!(peer.has_sub(0x0A00) && peer.has_sub(0x0A01));
    assert!(h.bus.subscribers(0x0A02).is_empty());
}

#[test]
fn malformed_subscription_counts_as_receive_error() {
    let mut h = connected(test_config());
    h.inject_from(2, MsgType::Subscribe, vec![0x09]);
    h.engine.tick(2);

    let peer = h.engine.peers().get(0).unwrap();
    assert_eq!(peer.sub_count(), 0);
    assert_eq!(peer.counters.app_msg_recv_err, 1);
}

fn send_batch(h: &mut Harness, count: u16) {
    let entries = (0..count).map(|i| (0x0B00 + i, Qos::default())).collect();
    let report = SubscriptionReport::All(entries);
    h.bus
        .send(BusMessage::new(report.msg_id(), report.encode(), SenderId::App("SB".into())))
        .unwrap();
}

#[test]
fn oversized_subscription_batch_is_rejected() {
    let mut h = Harness::new(&[]);

    send_batch(&mut h, SUB_ENTRIES_PER_PKT as u16 + 1);
    h.engine.tick(0);
    assert!(h.engine.local_subs().is_empty());

    send_batch(&mut h, SUB_ENTRIES_PER_PKT as u16);
    h.engine.tick(1);
    assert_eq!(h.engine.local_subs().len(), SUB_ENTRIES_PER_PKT);
}

#[test]
fn event_messages_stay_local() {
    let mut h = connected(test_config());
    let app = h.app_pipe("APP");
    h.bus.subscribe(EVS_EVENT_MSG_MID, app).unwrap();
    h.engine.tick(2);

    assert!(h.engine.local_subs().is_empty());
    assert!(sent_ids(&h, MsgType::Subscribe).is_empty());
}

#[test]
fn local_table_is_bounded() {
    let config = EngineConfig { max_subs_per_peer: 1, ..test_config() };
    let mut h = connected(config);
    let app = h.app_pipe("APP");

    h.bus.subscribe(0x0C00, app).unwrap();
    h.bus.subscribe(0x0C01, app).unwrap();
    h.engine.tick(2);

    assert_eq!(h.engine.local_subs().len(), 1);
    assert_eq!(sent_ids(&h, MsgType::Subscribe), vec![0x0C00]);
}
