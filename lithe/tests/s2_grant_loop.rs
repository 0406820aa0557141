//! S2 (spec.md §8): a root 2LS on one vcore requests four; each `vcore_enter` grants
//! straight to its sole (nested) child, which runs N=1000 compute tasks in parallel across
//! however many vcores arrive, then yields each vcore back up as its work runs out. After
//! the child exits, the root's base-level vcore count must have drained to zero.

mod support;

use lithe::{
    lithe_init, lithe_sched_current, lithe_sched_enter, lithe_sched_exit, lithe_shutdown,
    lithe_task_exit, lithe_task_yield, lithe_vcore_request, LitheConfig,
};
use support::toy_2ls::{GrantingScheduler, ToyScheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const N: usize = 1000;

fn init_logging() {
    #[cfg(target_family = "unix")]
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn s2_grant_loop_runs_compute_tasks_and_drains() {
    init_logging();

    let completed = Arc::new(AtomicUsize::new(0));
    let inner = ToyScheduler::new();
    let inner_exited = Arc::new(AtomicUsize::new(0));

    let bootstrap = {
        let completed = completed.clone();
        let inner = inner.clone();
        let inner_exited = inner_exited.clone();
        move || {
            lithe_sched_enter(Box::new(inner.clone())).expect("inner sched_enter failed");

            let me = lithe_sched_current();
            for _ in 0..N {
                let completed = completed.clone();
                inner.spawn(me, move || {
                    completed.fetch_add(1, Ordering::SeqCst);
                    lithe_task_exit();
                });
            }

            lithe_vcore_request(3);

            while completed.load(Ordering::SeqCst) < N {
                lithe_task_yield();
            }

            lithe_sched_exit();
            inner_exited.store(1, Ordering::SeqCst);
        }
    };

    let outer = GrantingScheduler::new(bootstrap);

    lithe_init(LitheConfig::default().with_max_vcores(4));
    lithe_sched_enter(Box::new(outer.clone())).expect("root sched_enter failed");
    lithe_vcore_request(1);

    let mut waited = Duration::ZERO;
    while inner_exited.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(inner_exited.load(Ordering::SeqCst), 1, "inner scheduler should have exited");
    assert_eq!(completed.load(Ordering::SeqCst), N);

    // Give the vcores that were granted to the (now-exited) inner scheduler time to drain
    // all the way back up through the outer scheduler to base.
    let mut drained = false;
    let mut waited = Duration::ZERO;
    while waited < Duration::from_secs(5) {
        if outer.base_vcores() == Some(0) {
            drained = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert!(drained, "base vcore count should reach 0 once the grant loop drains");

    lithe_shutdown();
}
