// Contract tests for the persistent collections through the public API.
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use stowage::api::{
    Cache, ErrorKind, List, Map, PriorityQueue, Queue, Set, Stack, Store, StoreOptions,
};

fn open_store(dir: &tempfile::TempDir, sweep_interval: Duration) -> Store {
    let options = StoreOptions::new().with_sweep_interval(sweep_interval);
    Store::open_with(dir.path().join("contract.sqlite"), options).expect("open store")
}

#[test]
fn queue_scenario_with_expiring_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_millis(20));
    let queue: Queue<String> = Queue::new(&store, "tasks").expect("queue");

    for task in ["process-email-1", "process-image-2", "send-notification-3"] {
        queue.enqueue(&task.to_string()).expect("enqueue");
    }
    queue
        .enqueue_ex(&"temp-task-4".to_string(), Duration::from_millis(50))
        .expect("enqueue_ex");
    assert_eq!(queue.size().expect("size"), 4);

    assert_eq!(
        queue.dequeue().expect("dequeue"),
        Some("process-email-1".to_string())
    );
    assert_eq!(
        queue.dequeue().expect("dequeue"),
        Some("process-image-2".to_string())
    );

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.size().expect("size"), 1);
    let remaining: Vec<String> = queue.entries().collect();
    assert!(queue.iter_error().is_none());
    assert_eq!(remaining, vec!["send-notification-3".to_string()]);
    store.close().expect("close");
}

#[test]
fn map_scenario_with_delete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_secs(1));
    let map: Map<String, String> = Map::new(&store, "names").expect("map");

    map.set("name1", "value1").expect("set");
    map.set("name2", "value2").expect("set");
    map.delete("name2").expect("delete");

    assert_eq!(map.size().expect("size"), 1);
    assert!(!map.has("name2").expect("has"));
    let entries: BTreeMap<String, String> = map.entries().collect();
    assert!(map.iter_error().is_none());
    assert_eq!(
        entries,
        BTreeMap::from([("name1".to_string(), "value1".to_string())])
    );
}

#[test]
fn never_written_keys_are_absent_everywhere() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_secs(1));
    let map: Map<String, u32> = Map::new(&store, "m").expect("map");
    let set: Set<String> = Set::new(&store, "s").expect("set");
    let cache: Cache<String, u32> = Cache::new(&store, "c", Duration::from_secs(5)).expect("cache");

    assert_eq!(map.get("ghost").expect("map get"), None);
    assert!(!set.has("ghost").expect("set has"));
    assert_eq!(cache.get("ghost").expect("cache get"), None);
    assert_eq!(cache.get_ex("ghost").expect("cache get_ex"), None);
}

#[test]
fn ttl_expiry_holds_with_and_without_sweep() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_millis(10));
    let map: Map<String, String> = Map::new(&store, "ttl").expect("map");

    map.set_ex("token", "abc", Duration::from_millis(60)).expect("set_ex");
    assert_eq!(map.get("token").expect("get"), Some("abc".to_string()));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(map.get("token").expect("get"), None);

    // The sweep has had several ticks by now, so the row itself is gone.
    let removed: usize = store
        .sweep_now()
        .expect("sweep")
        .iter()
        .map(|report| report.removed)
        .sum();
    assert_eq!(removed, 0);
}

#[test]
fn list_positions_stay_contiguous() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_secs(3600));
    let list: List<u32> = List::new(&store, "dense").expect("list");

    for value in 0..8 {
        list.append(&value).expect("append");
    }
    for position in [0, 3, 5] {
        list.delete(position).expect("delete");
    }
    list.append(&100).expect("append");

    let size = list.size().expect("size");
    let by_position: Vec<u32> = (0..size)
        .map(|position| list.get(position).expect("get").expect("live position"))
        .collect();
    let iterated: Vec<u32> = list.values().collect();
    assert_eq!(by_position, iterated);
    assert_eq!(iterated, vec![1, 2, 3, 5, 6, 100]);
    assert_eq!(list.get(size).expect("past end"), None);

    let err = list.delete(size).expect_err("past end");
    assert_eq!(err.kind(), ErrorKind::PositionNotFound);
}

#[test]
fn orderings_hold_under_interleaving() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_secs(3600));
    let queue: Queue<u32> = Queue::new(&store, "q").expect("queue");
    let stack: Stack<u32> = Stack::new(&store, "s").expect("stack");
    let pqueue: PriorityQueue<u32> = PriorityQueue::new(&store, "p").expect("pqueue");

    queue.enqueue(&1).expect("enqueue");
    queue.enqueue(&2).expect("enqueue");
    assert_eq!(queue.dequeue().expect("dequeue"), Some(1));
    queue.enqueue(&3).expect("enqueue");
    assert_eq!(queue.dequeue().expect("dequeue"), Some(2));
    assert_eq!(queue.dequeue().expect("dequeue"), Some(3));
    assert_eq!(queue.dequeue().expect("dequeue"), None);

    stack.push(&1).expect("push");
    stack.push(&2).expect("push");
    assert_eq!(stack.pop().expect("pop"), Some(2));
    stack.push(&3).expect("push");
    assert_eq!(stack.pop().expect("pop"), Some(3));
    assert_eq!(stack.pop().expect("pop"), Some(1));

    pqueue.enqueue(&10, 1).expect("enqueue");
    pqueue.enqueue(&20, 5).expect("enqueue");
    pqueue.enqueue(&21, 5).expect("enqueue");
    assert_eq!(pqueue.dequeue().expect("dequeue"), Some(20));
    pqueue.enqueue(&30, 9).expect("enqueue");
    assert_eq!(pqueue.dequeue().expect("dequeue"), Some(30));
    assert_eq!(pqueue.dequeue().expect("dequeue"), Some(21));
    assert_eq!(pqueue.dequeue().expect("dequeue"), Some(10));
}

#[test]
fn concurrent_consumers_never_share_a_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_millis(5));
    let queue: Queue<u32> = Queue::new(&store, "shared").expect("queue");
    let stack: Stack<u32> = Stack::new(&store, "shared").expect("stack");
    let total = 400u32;
    for n in 0..total {
        queue.enqueue(&n).expect("enqueue");
        stack.push(&n).expect("push");
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                let queue: Queue<u32> = Queue::new(&store, "shared").expect("queue");
                let stack: Stack<u32> = Stack::new(&store, "shared").expect("stack");
                let mut dequeued = Vec::new();
                let mut popped = Vec::new();
                loop {
                    let from_queue = queue.dequeue().expect("dequeue");
                    let from_stack = stack.pop().expect("pop");
                    if from_queue.is_none() && from_stack.is_none() {
                        break;
                    }
                    dequeued.extend(from_queue);
                    popped.extend(from_stack);
                }
                (dequeued, popped)
            })
        })
        .collect();

    let mut dequeued = Vec::new();
    let mut popped = Vec::new();
    for worker in workers {
        let (queue_part, stack_part) = worker.join().expect("worker");
        dequeued.extend(queue_part);
        popped.extend(stack_part);
    }
    assert_eq!(dequeued.len(), total as usize);
    assert_eq!(dequeued.iter().collect::<HashSet<_>>().len(), total as usize);
    assert_eq!(popped.len(), total as usize);
    assert_eq!(popped.iter().collect::<HashSet<_>>().len(), total as usize);
    assert_eq!(queue.size().expect("size"), 0);
    assert_eq!(stack.size().expect("size"), 0);
}

#[test]
fn cache_get_ex_is_a_sliding_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, Duration::from_secs(3600));
    let cache: Cache<String, String> =
        Cache::new(&store, "sessions", Duration::from_millis(150)).expect("cache");

    cache.set("s1", "alice").expect("set");
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get_ex("s1").expect("get_ex"), Some("alice".to_string()));
    }
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(cache.get("s1").expect("get"), None);
}

#[test]
fn reopening_addresses_the_same_tables() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = open_store(&dir, Duration::from_secs(3600));
        let map: Map<String, u32> = Map::new(&store, "Counters").expect("map");
        map.set("hits", &7).expect("set");
        store.close().expect("close");
        store.close().expect("second close");
        let err = map.get("hits").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::StoreClosed);
    }

    let store = open_store(&dir, Duration::from_secs(3600));
    let map: Map<String, u32> = Map::new(&store, "counters").expect("map");
    assert_eq!(map.get("hits").expect("get"), Some(7));
    assert_eq!(store.registered_tables(), vec!["map_counters"]);
}
