use tallyd::agent::queue::{AgentQueue, MAX_AGENT_QUEUE};
use tallyd::core::TallydError;
use tallyd::core::protocol::message::{ClusterProcsMsg, JobStartMsg};
use tallyd::core::protocol::{Message, MessageKind, PROTOCOL_VERSION};

fn job_start_payload(seq: u64) -> bytes::Bytes {
    Message::JobStart(JobStartMsg {
        assoc_id: 0,
        block_id: None,
        eligible_time: seq,
        job_id: seq as u32,
        job_state: 1,
        name: None,
        nodes: None,
        priority: 0,
        start_time: seq,
        submit_time: seq,
        total_procs: 1,
    })
    .pack(PROTOCOL_VERSION)
    .unwrap()
}

fn cluster_procs_payload(seq: u64) -> bytes::Bytes {
    Message::ClusterProcs(ClusterProcsMsg {
        cluster_name: None,
        proc_count: 1,
        event_time: seq,
    })
    .pack(PROTOCOL_VERSION)
    .unwrap()
}

fn event_time_of(payload: &bytes::Bytes) -> u64 {
    let Message::ClusterProcs(m) = Message::unpack(payload, PROTOCOL_VERSION).unwrap() else {
        panic!("expected a ClusterProcs payload");
    };
    m.event_time
}

#[test]
fn test_fifo_discipline() {
    let mut queue = AgentQueue::new();
    for seq in 0..10 {
        queue.push(cluster_procs_payload(seq)).unwrap();
    }
    // Peek leaves the head in place until the pop commits it.
    assert_eq!(event_time_of(&queue.peek_front().unwrap()), 0);
    assert_eq!(event_time_of(&queue.peek_front().unwrap()), 0);
    for seq in 0..10 {
        assert_eq!(event_time_of(&queue.pop_front().unwrap()), seq);
    }
    assert!(queue.is_empty());
}

#[test]
fn test_purge_drops_only_restartable_kinds_preserving_order() {
    let mut queue = AgentQueue::new();

    // Alternate job starts and cluster reports up to one below capacity.
    for seq in 0..(MAX_AGENT_QUEUE as u64 - 1) {
        let payload = if seq % 2 == 0 {
            job_start_payload(seq)
        } else {
            cluster_procs_payload(seq)
        };
        queue.push(payload).unwrap();
    }
    assert_eq!(queue.len(), MAX_AGENT_QUEUE - 1);

    // The next push lands on the purge threshold and must succeed.
    queue.push(cluster_procs_payload(u64::MAX)).unwrap();

    let entries = queue.drain();
    assert!(
        entries
            .iter()
            .all(|p| MessageKind::peek(p) == Some(MessageKind::ClusterProcs)),
        "job starts survived the purge"
    );

    // Survivors keep their original relative order.
    let times: Vec<u64> = entries.iter().map(event_time_of).collect();
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*times.last().unwrap(), u64::MAX);
    assert_eq!(entries.len(), (MAX_AGENT_QUEUE - 1) / 2 + 1);
}

#[test]
fn test_queue_full_when_nothing_purgeable() {
    let mut queue = AgentQueue::new();
    for seq in 0..(MAX_AGENT_QUEUE as u64 - 1) {
        queue.push(cluster_procs_payload(seq)).unwrap();
    }
    // Purge threshold, but nothing restartable to drop.
    queue.push(cluster_procs_payload(9_999)).unwrap();
    assert_eq!(queue.len(), MAX_AGENT_QUEUE);

    assert!(matches!(
        queue.push(cluster_procs_payload(10_000)),
        Err(TallydError::QueueFull)
    ));
    assert_eq!(queue.len(), MAX_AGENT_QUEUE);
}

#[test]
fn test_half_full_warning_rate_limited() {
    let mut queue = AgentQueue::new();
    for seq in 0..(MAX_AGENT_QUEUE as u64 / 2) {
        queue.push(cluster_procs_payload(seq)).unwrap();
    }
    assert_eq!(queue.high_water_logs, 0);

    // Every push past the high-water mark wants to warn; the 120-second
    // window lets only the first through.
    for seq in 0..100 {
        queue.push(cluster_procs_payload(seq)).unwrap();
    }
    assert_eq!(queue.high_water_logs, 1);
}

#[test]
fn test_restore_bypasses_admission_policy() {
    let mut queue = AgentQueue::new();
    queue.restore(cluster_procs_payload(1));
    queue.restore(job_start_payload(2));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.high_water_logs, 0);
}
