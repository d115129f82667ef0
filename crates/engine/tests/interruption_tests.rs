mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use support::{Error, Journal, Latch, runtime};
use tokio::sync::Notify;
use weft_engine::{Callback, Cause, Effect, Exit, FiberId, FiberStatus};

fn forever() -> Effect<(), Error> {
    Effect::sleep(Duration::from_secs(3600))
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_waits_for_the_uninterruptible_region_and_its_finalizer() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let region = started
        .open()
        .zip_right(Effect::sleep(Duration::from_millis(50)))
        .zip_right(journal.record("region body done"))
        .ensuring(
            Effect::sleep(Duration::from_millis(50)).zip_right(journal.record("region finalizer done")),
        )
        .uninterruptible();

    let program = region.fork().flat_map({
        let journal = journal.clone();
        move |fiber| {
            let journal = journal.clone();
            started
                .wait()
                .zip_right(fiber.interrupt())
                .flat_map(move |exit: Exit<(), Error>| journal.record("interrupt returned").as_value(exit.clone()))
        }
    });
    let exit = runtime.run_to_exit(program).await;

    let child_exit = exit.into_result().expect("parent succeeds");
    let cause = child_exit.cause().expect("child was interrupted");
    assert!(cause.is_interrupt(), "unexpected cause: {cause:?}");
    assert_eq!(
        journal.entries(),
        vec!["region body done", "region finalizer done", "interrupt returned"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn interruptible_fiber_stops_promptly_and_runs_finalizers() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let sleeper = started.open().zip_right(forever()).ensuring(journal.record("finalized"));

    let program = Effect::fiber_id().flat_map(move |parent: FiberId| {
        let started = started.clone();
        sleeper
            .clone()
            .fork()
            .flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()))
            .map(move |exit| (parent, exit))
    });
    let (parent, child_exit) = runtime.run_to_exit(program).await.into_result().expect("parent succeeds");

    assert_eq!(child_exit, Exit::fail_cause(Cause::interrupt(parent)));
    assert_eq!(journal.entries(), vec!["finalized"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_finalizers_run_innermost_first() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let body = started
        .open()
        .zip_right(forever())
        .ensuring(journal.record("inner"))
        .ensuring(journal.record("middle"))
        .ensuring(journal.record("outer"));
    let program = body
        .fork()
        .flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()))
        .as_unit();
    runtime.run_to_exit(program).await;
    assert_eq!(journal.entries(), vec!["inner", "middle", "outer"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_reenables_interruption_inside_a_mask() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let masked = Effect::uninterruptible_mask({
        let started = started.clone();
        let journal = journal.clone();
        move |restore| {
            started
                .open()
                .zip_right(restore.apply(forever()))
                .ensuring(journal.record("released"))
        }
    });
    let program = masked.fork().flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()));
    let child_exit = tokio::time::timeout(Duration::from_secs(5), runtime.run_to_exit(program))
        .await
        .expect("restored region is interruptible")
        .into_result()
        .expect("parent succeeds");
    assert!(child_exit.cause().is_some_and(Cause::is_interrupt));
    assert!(journal.contains("released"));
}

#[tokio::test(flavor = "multi_thread")]
async fn interruptible_region_inside_uninterruptible_one_is_cancellable() {
    let runtime = runtime();
    let started = Latch::new();
    let body = started.open().zip_right(forever().interruptible()).uninterruptible();
    let program = body.fork().flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()));
    let child_exit = tokio::time::timeout(Duration::from_secs(5), runtime.run_to_exit(program))
        .await
        .expect("inner region is interruptible")
        .into_result()
        .expect("parent succeeds");
    assert!(child_exit.cause().is_some_and(Cause::is_interrupt));
}

#[tokio::test(flavor = "multi_thread")]
async fn async_canceler_runs_when_the_waiting_fiber_is_interrupted() {
    let runtime = runtime();
    let journal = Journal::new();
    let registered = Arc::new(Notify::new());
    let pending_callback: Arc<Mutex<Option<Callback<u32, Error>>>> = Arc::default();

    let waiting = Effect::async_interruptible({
        let journal = journal.clone();
        let registered = registered.clone();
        let pending_callback = pending_callback.clone();
        move |callback: Callback<u32, Error>| {
            *pending_callback.lock().expect("callback slot") = Some(callback);
            registered.notify_one();
            journal.record("canceled")
        }
    });
    let fiber = runtime.run(waiting, Default::default());
    registered.notified().await;
    fiber.request_interrupt();

    let exit = fiber.wait().await;
    assert_eq!(exit, Exit::fail_cause(Cause::interrupt(FiberId::NONE)));
    assert_eq!(fiber.status(), FiberStatus::Done);
    assert!(journal.contains("canceled"));
}

#[tokio::test(flavor = "multi_thread")]
async fn parent_exit_interrupts_supervised_children() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let child = started.open().zip_right(forever()).ensuring(journal.record("child finalized"));
    let program = child.fork().zip_right(started.wait()).as_value("parent done");
    let exit = runtime.run_to_exit(program).await;
    assert_eq!(exit, Exit::Success("parent done"));
    assert!(journal.contains("child finalized"), "child finalizer ran before the parent exit was published");
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_children_outlive_their_parent() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let daemon = started.open().zip_right(forever()).ensuring(journal.record("daemon finalized"));
    let program = daemon.fork_daemon().flat_map(move |fiber| started.wait().as_value(fiber));

    let fiber = runtime.run_to_exit(program).await.into_result().expect("parent succeeds");
    assert_ne!(fiber.status(), FiberStatus::Done);
    assert!(fiber.poll().is_none());
    assert!(!journal.contains("daemon finalized"));

    fiber.request_interrupt();
    let exit = fiber.wait().await;
    assert_eq!(exit, Exit::fail_cause(Cause::interrupt(FiberId::NONE)));
    assert!(journal.contains("daemon finalized"));
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupting_a_race_interrupts_every_contestant() {
    let runtime = runtime();
    let journal = Journal::new();
    let left_started = Latch::new();
    let right_started = Latch::new();
    let left = left_started.open().zip_right(forever()).ensuring(journal.record("left finalized"));
    let right = right_started.open().zip_right(forever()).ensuring(journal.record("right finalized"));

    let program = left.race(right).fork().flat_map(move |fiber| {
        left_started
            .wait()
            .zip_right(right_started.wait())
            .zip_right(fiber.interrupt())
    });
    let child_exit = runtime.run_to_exit(program).await.into_result().expect("parent succeeds");
    assert!(child_exit.cause().is_some_and(Cause::is_interrupt));
    assert!(journal.contains("left finalized"));
    assert!(journal.contains("right finalized"));
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupting_a_finished_fiber_returns_its_exit() {
    let runtime = runtime();
    let program = Effect::<u8, Error>::succeed(3)
        .fork()
        .flat_map(|fiber| fiber.join().zip_right(fiber.interrupt()));
    let exit = runtime.run_to_exit(program).await;
    assert_eq!(exit, Exit::Success(Exit::Success(3)));
}

#[tokio::test(flavor = "multi_thread")]
async fn interruptible_mask_opens_an_uninterruptible_region() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let body = Effect::interruptible_mask({
        let started = started.clone();
        let journal = journal.clone();
        move |_restore| started.open().zip_right(forever()).ensuring(journal.record("released"))
    })
    .uninterruptible();
    let program = body.fork().flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()));
    let child_exit = tokio::time::timeout(Duration::from_secs(5), runtime.run_to_exit(program))
        .await
        .expect("masked region is interruptible")
        .into_result()
        .expect("parent succeeds");
    assert!(child_exit.cause().is_some_and(Cause::is_interrupt));
    assert!(journal.contains("released"));
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_inside_interruptible_mask_returns_to_the_outer_uninterruptible_state() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let body = Effect::interruptible_mask({
        let started = started.clone();
        let journal = journal.clone();
        move |restore| {
            restore.apply(
                started
                    .open::<Error>()
                    .zip_right(Effect::sleep(Duration::from_millis(50)))
                    .zip_right(journal.record("restored region finished")),
            )
        }
    })
    .uninterruptible();
    let program = body.fork().flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()));
    let child_exit = runtime.run_to_exit(program).await.into_result().expect("parent succeeds");
    assert!(child_exit.cause().is_some_and(Cause::is_interrupt));
    assert_eq!(journal.entries(), vec!["restored region finished"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_inside_a_nested_uninterruptible_mask_stays_uninterruptible() {
    let runtime = runtime();
    let journal = Journal::new();
    let started = Latch::new();
    let body = Effect::uninterruptible_mask({
        let started = started.clone();
        let journal = journal.clone();
        move |restore| {
            restore.apply(
                started
                    .open::<Error>()
                    .zip_right(Effect::sleep(Duration::from_millis(50)))
                    .zip_right(journal.record("body finished")),
            )
        }
    })
    .uninterruptible();
    let program = body.fork().flat_map(move |fiber| started.wait().zip_right(fiber.interrupt()));
    let child_exit = runtime.run_to_exit(program).await.into_result().expect("parent succeeds");
    assert!(child_exit.cause().is_some_and(Cause::is_interrupt));
    assert_eq!(journal.entries(), vec!["body finished"]);
}
