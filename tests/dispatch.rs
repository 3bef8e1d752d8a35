//! Dispatch-engine properties, exercised over scripted in-memory backends so
//! every hand-off and retry path is deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use aio_dispatch::{
    AioBackend, AlignedBuf, CallbackPool, Direction, IoTask, PoolConfig, Reaper, SchedulePolicy,
    SubmitError, SubmitErrorKind, Submitter,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// In-memory backend: rejects submissions according to a script of booleans
/// (`true` = reject that attempt), then completes accepted tasks in FIFO
/// order with `result = buffer length`.
struct ScriptedBackend {
    rejections: Mutex<VecDeque<bool>>,
    submitted_order: Mutex<Vec<(usize, u64)>>,
    inflight: Mutex<VecDeque<Box<IoTask>>>,
}

impl ScriptedBackend {
    fn new(rejections: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            rejections: Mutex::new(rejections.into()),
            submitted_order: Mutex::new(Vec::new()),
            inflight: Mutex::new(VecDeque::new()),
        })
    }

    fn always_accepting() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn submitted_order(&self) -> Vec<(usize, u64)> {
        self.submitted_order.lock().unwrap().clone()
    }
}

impl AioBackend for ScriptedBackend {
    fn submit(&self, task: Box<IoTask>) -> Result<(), SubmitError> {
        let reject = self.rejections.lock().unwrap().pop_front().unwrap_or(false);
        if reject {
            return Err(SubmitError::new(SubmitErrorKind::QueueFull, task));
        }
        self.submitted_order
            .lock()
            .unwrap()
            .push((task.index, task.offset));
        self.inflight.lock().unwrap().push_back(task);
        Ok(())
    }

    fn reap(&self) -> Option<Box<IoTask>> {
        let mut task = self.inflight.lock().unwrap().pop_front()?;
        task.result = task.buf.len() as i32;
        Some(task)
    }
}

fn one_byte_task(index: usize, offset: u64, payload: u8) -> Box<IoTask> {
    let mut task = IoTask::new(0, Direction::Write, offset, AlignedBuf::from_bytes(&[payload], 1));
    task.index = index;
    task
}

fn wait_until(mut done: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// §Exactly-once delivery and single ownership: N producers, every task's
/// callback fires exactly once, and the per-task delivery flag riding in
/// `context` catches any double delivery the instant it happens.
#[test]
fn exactly_once_completion_under_concurrent_producers() {
    const PRODUCERS: usize = 4;
    const TASKS_PER_PRODUCER: u64 = 64;
    const TOTAL: usize = PRODUCERS * TASKS_PER_PRODUCER as usize;

    let backend = ScriptedBackend::always_accepting();
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let mut reaper = Reaper::spawn(backend.clone(), None).unwrap();

    let completions: Arc<Mutex<HashMap<(usize, u64), u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let held: Arc<Mutex<Vec<Box<IoTask>>>> = Arc::new(Mutex::new(Vec::new()));

    let callback: aio_dispatch::TaskCallback = {
        let completions = Arc::clone(&completions);
        let held = Arc::clone(&held);
        Arc::new(move |task: Box<IoTask>| {
            let delivered = task
                .context
                .as_ref()
                .and_then(|ctx| ctx.downcast_ref::<AtomicBool>())
                .expect("delivery tag missing");
            assert!(
                !delivered.swap(true, Ordering::SeqCst),
                "task delivered twice"
            );

            *completions
                .lock()
                .unwrap()
                .entry((task.index, task.offset))
                .or_insert(0) += 1;
            // Keep the box alive so completed-task addresses stay distinct.
            held.lock().unwrap().push(task);
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let handle = submitter.handle();
            let callback = Arc::clone(&callback);
            thread::spawn(move || {
                for seq in 0..TASKS_PER_PRODUCER {
                    let mut task = one_byte_task(producer, seq, seq as u8);
                    task.callback = Some(Arc::clone(&callback));
                    task.context = Some(Box::new(AtomicBool::new(false)));
                    handle.enqueue(task);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    wait_until(
        || completions.lock().unwrap().len() == TOTAL,
        "all completions",
    );
    submitter.shutdown();
    reaper.shutdown();

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), TOTAL);
    assert!(completions.values().all(|&count| count == 1));

    let held = held.lock().unwrap();
    let mut addresses: Vec<usize> = held
        .iter()
        .map(|task| &**task as *const IoTask as usize)
        .collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), TOTAL, "same task delivered through two owners");
}

/// §FIFO per producer: a task rejected K times still reaches the backend
/// before anything enqueued after it.
#[test]
fn fifo_preserved_across_rejections() {
    let backend = ScriptedBackend::new(vec![true, true, true]);
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let handle = submitter.handle();

    for seq in 0..8 {
        handle.enqueue(one_byte_task(0, seq, seq as u8));
    }

    wait_until(|| backend.submitted_order().len() == 8, "all submissions");
    submitter.shutdown();

    let order: Vec<u64> = backend.submitted_order().iter().map(|&(_, o)| o).collect();
    assert_eq!(order, (0..8).collect::<Vec<u64>>());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// §FIFO under arbitrary rejection patterns: whatever the backend's
    /// reject script, per-producer order is preserved.
    #[test]
    fn fifo_preserved_under_random_rejection(
        rejections in proptest::collection::vec(any::<bool>(), 0..48),
        task_count in 1u64..16,
    ) {
        let backend = ScriptedBackend::new(rejections);
        let mut submitter = Submitter::spawn(backend.clone()).unwrap();
        let handle = submitter.handle();

        for seq in 0..task_count {
            handle.enqueue(one_byte_task(0, seq, seq as u8));
        }

        wait_until(
            || backend.submitted_order().len() == task_count as usize,
            "all submissions",
        );
        submitter.shutdown();

        let order: Vec<u64> = backend.submitted_order().iter().map(|&(_, o)| o).collect();
        prop_assert_eq!(order, (0..task_count).collect::<Vec<u64>>());
    }
}

/// §Retry on submission failure: fail the first K attempts, then succeed;
/// the task completes exactly once with the right result.
#[test]
fn rejected_submission_eventually_completes_once() {
    let backend = ScriptedBackend::new(vec![true; 5]);
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let mut reaper = Reaper::spawn(backend.clone(), None).unwrap();

    let (tx, rx) = mpsc::channel();
    let mut task = one_byte_task(0, 0, 0x42);
    task.callback = Some(Arc::new(move |task: Box<IoTask>| {
        tx.send(task.result).unwrap();
    }));
    submitter.handle().enqueue(task);

    let result = rx.recv_timeout(WAIT_LIMIT).expect("completion never arrived");
    assert_eq!(result, 1);
    assert!(
        rx.recv_timeout(Duration::from_millis(50)).is_err(),
        "duplicate completion"
    );

    submitter.shutdown();
    reaper.shutdown();
}

/// §Re-arm chaining: a read whose callback flips it to a write and
/// re-enqueues it produces a second, independent completion, with the
/// original offset/length snapshot intact end-to-end.
#[test]
fn rearm_read_to_write_chains_two_completions() {
    const FIRST_OFFSET: u64 = 512;
    const REARMED_OFFSET: u64 = 4096;
    const LEN: usize = 64;

    let backend = ScriptedBackend::always_accepting();
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let mut reaper = Reaper::spawn(backend.clone(), None).unwrap();
    let handle = submitter.handle();

    let (tx, rx) = mpsc::channel();
    let mut task = IoTask::new(
        0,
        Direction::Read,
        FIRST_OFFSET,
        AlignedBuf::new_zeroed(LEN, 8),
    );
    let chain_handle = handle.clone();
    task.callback = Some(Arc::new(move |mut task: Box<IoTask>| {
        assert_eq!(task.first_offset(), FIRST_OFFSET);
        assert_eq!(task.first_len(), LEN);
        match task.direction {
            Direction::Read => {
                assert_eq!(task.transferred(), Ok(LEN));
                task.rearm(Direction::Write, REARMED_OFFSET);
                chain_handle.enqueue(task);
            }
            Direction::Write => {
                assert_eq!(task.offset, REARMED_OFFSET);
                tx.send((task.first_offset(), task.first_len(), task.result))
                    .unwrap();
            }
        }
    }));
    handle.enqueue(task);

    let (first_offset, first_len, result) =
        rx.recv_timeout(WAIT_LIMIT).expect("chain never finished");
    assert_eq!(first_offset, FIRST_OFFSET);
    assert_eq!(first_len, LEN);
    assert_eq!(result, LEN as i32);

    let order = backend.submitted_order();
    assert_eq!(order.len(), 2, "each phase submitted exactly once");

    submitter.shutdown();
    reaper.shutdown();
}

/// §Completion errors pass through verbatim; the engine never interprets
/// or retries them.
#[test]
fn completion_error_surfaces_verbatim() {
    struct FailingBackend {
        inflight: Mutex<VecDeque<Box<IoTask>>>,
    }

    impl AioBackend for FailingBackend {
        fn submit(&self, task: Box<IoTask>) -> Result<(), SubmitError> {
            self.inflight.lock().unwrap().push_back(task);
            Ok(())
        }

        fn reap(&self) -> Option<Box<IoTask>> {
            let mut task = self.inflight.lock().unwrap().pop_front()?;
            task.result = -libc::EIO;
            Some(task)
        }
    }

    let backend = Arc::new(FailingBackend {
        inflight: Mutex::new(VecDeque::new()),
    });
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let mut reaper = Reaper::spawn(backend, None).unwrap();

    let (tx, rx) = mpsc::channel();
    let mut task = one_byte_task(0, 0, 0);
    task.callback = Some(Arc::new(move |task: Box<IoTask>| {
        tx.send(task.transferred()).unwrap();
    }));
    submitter.handle().enqueue(task);

    assert_eq!(
        rx.recv_timeout(WAIT_LIMIT).expect("completion never arrived"),
        Err(libc::EIO)
    );
    submitter.shutdown();
    reaper.shutdown();
}

/// §Pool backpressure: once a worker is busy and its bounded queue is full,
/// dispatch reports saturation instead of buffering or losing the task.
#[test]
fn pool_rejects_when_worker_queue_is_full() {
    let pool = CallbackPool::start(&PoolConfig {
        workers: 1,
        queue_capacity: 2,
        policy: SchedulePolicy::RoundRobin,
    })
    .unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));

    let blocking: aio_dispatch::TaskCallback = Arc::new(move |_task: Box<IoTask>| {
        started_tx.send(()).unwrap();
        release_rx.lock().unwrap().recv().unwrap();
    });
    let noop: aio_dispatch::TaskCallback = Arc::new(|_task: Box<IoTask>| {});

    let mut blocker = one_byte_task(0, 0, 0);
    blocker.callback = Some(blocking);
    pool.dispatch(blocker).unwrap();
    started_rx
        .recv_timeout(WAIT_LIMIT)
        .expect("worker never picked up the blocking callback");

    // Worker is parked inside a callback; fill its queue to capacity.
    for seq in 1..=2 {
        let mut task = one_byte_task(0, seq, seq as u8);
        task.callback = Some(Arc::clone(&noop));
        pool.dispatch(task).unwrap();
    }

    let mut overflow = one_byte_task(0, 3, 3);
    overflow.callback = Some(Arc::clone(&noop));
    let saturated = pool.dispatch(overflow).expect_err("queue should be full");
    let returned = saturated.into_task();
    assert_eq!(returned.offset, 3, "rejected task came back intact");

    release_tx.send(()).unwrap();
    pool.shutdown();
}

/// §Scenario: queue depth 4, always-succeeding backend, four 1-byte writes
/// with distinct payloads. Four callbacks, results non-negative, all payloads
/// covered, no task delivered twice — in any completion order.
#[test]
fn four_distinct_writes_complete_once_each() {
    const PAYLOADS: [u8; 4] = [0x10, 0x11, 0x12, 0x13];

    let backend = ScriptedBackend::always_accepting();
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let mut reaper = Reaper::spawn(backend.clone(), None).unwrap();

    let seen: Arc<Mutex<Vec<(usize, u8, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let held: Arc<Mutex<Vec<Box<IoTask>>>> = Arc::new(Mutex::new(Vec::new()));

    let handle = submitter.handle();
    for (slot, &payload) in PAYLOADS.iter().enumerate() {
        let mut task = one_byte_task(0, slot as u64, payload);
        let seen = Arc::clone(&seen);
        let held = Arc::clone(&held);
        task.callback = Some(Arc::new(move |task: Box<IoTask>| {
            let address = &*task as *const IoTask as usize;
            seen.lock()
                .unwrap()
                .push((address, task.buf.as_slice()[0], task.result));
            held.lock().unwrap().push(task);
        }));
        handle.enqueue(task);
    }

    wait_until(|| seen.lock().unwrap().len() == 4, "four completions");
    submitter.shutdown();
    reaper.shutdown();

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|&(_, _, result)| result >= 0));

    let mut payloads: Vec<u8> = seen.iter().map(|&(_, payload, _)| payload).collect();
    payloads.sort_unstable();
    assert_eq!(payloads, PAYLOADS.to_vec());

    let mut addresses: Vec<usize> = seen.iter().map(|&(address, _, _)| address).collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), 4, "a task pointer was delivered twice");
}

/// §Completions flow through the pool when one is configured, and the pool
/// spreads work without dropping anything.
#[test]
fn pooled_delivery_completes_everything_exactly_once() {
    const TASKS: u64 = 32;

    let backend = ScriptedBackend::always_accepting();
    let pool = CallbackPool::start(&PoolConfig {
        workers: 3,
        queue_capacity: 8,
        policy: SchedulePolicy::RoundRobin,
    })
    .unwrap();
    let mut submitter = Submitter::spawn(backend.clone()).unwrap();
    let mut reaper = Reaper::spawn(backend.clone(), Some(pool.clone())).unwrap();

    let completions: Arc<Mutex<HashMap<u64, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let handle = submitter.handle();
    for seq in 0..TASKS {
        let mut task = one_byte_task(0, seq, seq as u8);
        let completions = Arc::clone(&completions);
        task.callback = Some(Arc::new(move |task: Box<IoTask>| {
            *completions.lock().unwrap().entry(task.offset).or_insert(0) += 1;
        }));
        handle.enqueue(task);
    }

    wait_until(
        || completions.lock().unwrap().len() == TASKS as usize,
        "pooled completions",
    );
    submitter.shutdown();
    reaper.shutdown();
    pool.shutdown();

    let completions = completions.lock().unwrap();
    assert!(completions.values().all(|&count| count == 1));
}
