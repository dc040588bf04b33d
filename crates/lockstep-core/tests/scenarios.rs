//! End-to-end scenarios for the Lockstep runtime.
//!
//! Each test drives a real [`Loop`] through the public API only: spawning
//! activities, cancelling them, waiting on conditions and inspecting the
//! recorded outcomes and turnstamps.

#![allow(clippy::unwrap_used)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lockstep_core::{
    ActivityError, ActivityState, Any, Condition, EndReason, Eternity, Fault, Flag,
    InterruptError, Loop, LoopConfig, SharedCondition, Subject, Time, Turnstamp, postpone, sleep,
};
use rust_decimal_macros::dec;

type Log = Rc<RefCell<Vec<(String, Turnstamp)>>>;

fn record(log: &Log, label: impl Into<String>, stamp: Turnstamp) {
    log.borrow_mut().push((label.into(), stamp));
}

#[derive(Debug, thiserror::Error)]
#[error("grinder jammed")]
struct GrinderJammed;

#[test]
fn immediate_value_is_recorded() {
    let mut lp = Loop::new(LoopConfig::default());
    let activity = lp.spawn(async { Ok(42_u32) });
    let summary = lp.run().unwrap();

    assert_eq!(activity.status(), ActivityState::Success);
    assert_eq!(activity.outcome().unwrap().unwrap(), 42);
    assert!(activity.is_finished());
    assert_eq!(summary.end_reason, EndReason::Idle);
}

#[test]
fn cancel_before_start_has_no_side_effects() {
    let mut lp = Loop::new(LoopConfig::default());
    let effects = Rc::new(Cell::new(0_u32));
    let counter = Rc::clone(&effects);
    let activity = lp.spawn(async move {
        counter.set(counter.get().saturating_add(1));
        Ok(())
    });

    activity.cancel();
    lp.run().unwrap();

    assert_eq!(effects.get(), 0);
    assert_eq!(activity.status(), ActivityState::Cancelled);
    assert!(activity.outcome().unwrap().unwrap_err().is_cancelled());
}

#[test]
fn repeated_cancel_of_running_activity_is_observed_once() {
    let mut lp = Loop::new(LoopConfig::default());
    let observed = Rc::new(Cell::new(0_u32));
    let counter = Rc::clone(&observed);
    let activity = lp.spawn(async move {
        loop {
            match sleep(Time::from(1_i64)).await {
                Ok(()) => {}
                Err(fault) => {
                    counter.set(counter.get().saturating_add(1));
                    return Err::<(), _>(fault);
                }
            }
        }
    });

    lp.run_turn().unwrap();
    assert_eq!(activity.status(), ActivityState::Running);
    activity.cancel_with("closing time");
    activity.cancel_with("closing time, really");
    lp.run().unwrap();

    assert_eq!(observed.get(), 1);
    assert_eq!(activity.status(), ActivityState::Cancelled);
    let error = activity.outcome().unwrap().unwrap_err();
    assert_eq!(error.to_string(), "activity#0 was cancelled: closing time");

    activity.cancel();
    assert_eq!(activity.status(), ActivityState::Cancelled);
}

#[test]
fn domain_failure_is_reraised_to_every_waiter() {
    let mut lp = Loop::new(LoopConfig::default());
    let handle = lp.handle();
    let grinder = handle.spawn(async {
        sleep(Time::from(2_i64)).await?;
        let ground: Result<u8, GrinderJammed> = Err(GrinderJammed);
        Ok(ground?)
    });

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let target = grinder.clone();
            handle.spawn(async move {
                let fault = (&target).await.unwrap_err();
                Ok(fault.as_failure().cloned())
            })
        })
        .collect();
    lp.run().unwrap();

    assert_eq!(grinder.status(), ActivityState::Failed);
    let failures: Vec<_> = waiters
        .iter()
        .map(|waiter| waiter.outcome().unwrap().unwrap().unwrap())
        .collect();
    for failure in &failures {
        assert!(failure.downcast_ref::<GrinderJammed>().is_some());
        assert!(failure.same(failures.first().unwrap()));
    }
}

#[test]
fn waiters_resume_together_in_one_turn() {
    let mut lp = Loop::new(LoopConfig::default());
    let handle = lp.handle();
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    let brew = handle.spawn({
        let handle = handle.clone();
        async move {
            handle.sleep(Time::new(dec!(2.5))).await?;
            Ok("cortado")
        }
    });
    for name in ["left", "right"] {
        let target = brew.clone();
        let log = Rc::clone(&log);
        let ctx = handle.clone();
        handle.spawn(async move {
            let value = (&target).await?;
            record(&log, format!("{name}:{value}"), ctx.turnstamp());
            Ok(())
        });
    }
    lp.run().unwrap();

    let log = log.borrow();
    assert_eq!(log.len(), 2);
    let (first, first_stamp) = log.first().unwrap();
    let (second, second_stamp) = log.get(1).unwrap();
    assert_eq!(first, "left:cortado");
    assert_eq!(second, "right:cortado");
    assert_eq!(first_stamp, second_stamp);
    assert_eq!(first_stamp.time, Time::new(dec!(2.5)));
}

fn cafe_run() -> (Vec<(String, Turnstamp)>, lockstep_core::RunSummary) {
    let mut lp = Loop::new(LoopConfig::default());
    let handle = lp.handle();
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    let mut orders = Vec::new();
    for (name, delay) in [("latte", 3_i64), ("mocha", 1), ("tea", 3), ("drip", 0)] {
        let log = Rc::clone(&log);
        let ctx = handle.clone();
        orders.push(handle.spawn(async move {
            record(&log, format!("{name} ordered"), ctx.turnstamp());
            ctx.sleep(Time::from(delay)).await?;
            record(&log, format!("{name} served"), ctx.turnstamp());
            Ok(())
        }));
    }

    let manager = {
        let log = Rc::clone(&log);
        let ctx = handle.clone();
        let tea = orders.get(2).cloned().unwrap();
        handle.spawn(async move {
            ctx.sleep(Time::from(2_i64)).await?;
            record(&log, "tea cancelled", ctx.turnstamp());
            tea.cancel();
            for _ in 0..2 {
                postpone().await?;
                record(&log, "manager idle", ctx.turnstamp());
            }
            Ok(())
        })
    };

    let summary = lp.run().unwrap();
    assert_eq!(manager.status(), ActivityState::Success);
    let entries = log.borrow().clone();
    (entries, summary)
}

#[test]
fn identical_runs_produce_identical_schedules() {
    let (first_log, first_summary) = cafe_run();
    let (second_log, second_summary) = cafe_run();
    assert_eq!(first_log, second_log);
    assert_eq!(first_summary, second_summary);
    assert!(first_log.iter().any(|(label, _)| label == "tea cancelled"));
    assert!(!first_log.iter().any(|(label, _)| label == "tea served"));
}

#[test]
fn observed_turnstamps_never_decrease() {
    let (log, summary) = cafe_run();
    for pair in log.windows(2) {
        if let [(_, earlier), (_, later)] = pair {
            assert!(earlier <= later, "{earlier} came before {later}");
        }
    }
    assert_eq!(summary.final_turnstamp.time, Time::from(3_i64));
}

#[test]
fn same_time_work_gets_increasing_turns() {
    let mut lp = Loop::new(LoopConfig::default());
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let handle = lp.handle();
    let ctx = handle.clone();
    let writer = Rc::clone(&log);
    lp.spawn(async move {
        for step in 0..3 {
            record(&writer, format!("step {step}"), ctx.turnstamp());
            postpone().await?;
        }
        Ok(())
    });
    lp.run().unwrap();

    let stamps: Vec<Turnstamp> = log.borrow().iter().map(|(_, stamp)| *stamp).collect();
    assert_eq!(
        stamps,
        vec![
            Turnstamp::new(Time::ZERO, 1),
            Turnstamp::new(Time::ZERO, 2),
            Turnstamp::new(Time::ZERO, 3),
        ]
    );
}

#[test]
fn dropping_the_loop_closes_suspended_work() {
    let (stuck, observer) = {
        let mut lp = Loop::new(LoopConfig::default());
        let handle = lp.handle();
        let gate = Flag::new(&handle);
        let stuck = handle.spawn({
            let gate = gate.clone();
            async move {
                gate.wait().await?;
                Ok(())
            }
        });
        let observer = stuck.clone();
        lp.run().unwrap();
        assert_eq!(stuck.status(), ActivityState::Running);
        (stuck, observer)
    };

    assert_eq!(stuck.status(), ActivityState::Failed);
    assert!(matches!(
        observer.outcome().unwrap(),
        Err(ActivityError::Closed { .. })
    ));
    assert!(observer.done().is_true());
}

#[test]
fn not_done_inverts_back_to_the_same_done() {
    let mut lp = Loop::new(LoopConfig::default());
    let activity = lp.spawn(async { Ok(()) });
    let done = activity.done();
    let not_done = activity.not_done();

    assert_eq!(!not_done.clone(), done);
    assert_eq!(!!done.clone(), done);
    assert!(not_done.is_true());
    lp.run().unwrap();
    assert!(!not_done.is_true());
    assert!(done.is_true());
}

#[test]
fn watchdog_cancels_slow_work() {
    let mut lp = Loop::new(LoopConfig::default());
    let handle = lp.handle();
    let slow = handle.spawn({
        let handle = handle.clone();
        async move {
            handle.sleep(Time::from(30_i64)).await?;
            Ok(())
        }
    });

    let watchdog = handle.spawn({
        let handle = handle.clone();
        let slow = slow.clone();
        async move {
            let deadline = handle.after(Time::from(10_i64));
            let either = Any::new([
                Rc::new(slow.done()) as SharedCondition,
                Rc::new(deadline) as SharedCondition,
            ]);
            either.wait().await?;
            if slow.is_finished() {
                return Ok(false);
            }
            slow.cancel_with("too slow");
            Ok(true)
        }
    });
    let summary = lp.run().unwrap();

    assert!(watchdog.outcome().unwrap().unwrap());
    assert_eq!(slow.status(), ActivityState::Cancelled);
    assert_eq!(summary.final_turnstamp.time, Time::from(10_i64));
}

#[test]
fn payload_sees_cancellation_as_interrupt() {
    let mut lp = Loop::new(LoopConfig::default());
    let activity = lp.spawn(async {
        match sleep(Time::from(5_i64)).await {
            Err(Fault::Interrupted(signal)) => Ok(signal.token().map(str::to_owned)),
            Err(other) => Err(other),
            Ok(()) => Ok(None),
        }
    });
    lp.run_turn().unwrap();
    activity.cancel_with("shift over");
    lp.run().unwrap();

    assert_eq!(activity.status(), ActivityState::Success);
    assert_eq!(
        activity.outcome().unwrap().unwrap().as_deref(),
        Some("shift over")
    );
}

#[test]
fn joined_results_complete_in_either_order() {
    let mut lp = Loop::new(LoopConfig::default());
    let handle = lp.handle();
    let slow = handle.spawn({
        let handle = handle.clone();
        async move {
            handle.sleep(Time::from(3_i64)).await?;
            Ok("espresso")
        }
    });
    let quick = handle.spawn({
        let handle = handle.clone();
        async move {
            handle.sleep(Time::from(2_i64)).await?;
            Ok("americano")
        }
    });

    let joiner = handle.spawn({
        let handle = handle.clone();
        async move {
            let (first, second) = futures::join!(slow.result(), quick.result());
            Ok((first?, second?, handle.now()))
        }
    });
    let summary = lp.run().unwrap();

    assert_eq!(joiner.status(), ActivityState::Success);
    assert_eq!(
        joiner.outcome().unwrap().unwrap(),
        ("espresso", "americano", Time::from(3_i64))
    );
    assert_eq!(summary.end_reason, EndReason::Idle);
}

#[test]
fn revoked_signal_is_skipped_without_moving_the_clock() {
    let mut lp = Loop::new(LoopConfig::default());
    let handle = lp.handle();
    let idler = lp.spawn(async {
        Eternity.wait().await?;
        Ok(())
    });
    lp.run_turn().unwrap();

    let late = handle.new_interrupt(Subject::Activity(idler.id()), Some("too late".to_owned()));
    handle
        .schedule(idler.task(), Some(late.clone()), Some(Time::from(50_i64)))
        .unwrap();
    assert!(late.is_pending());
    late.revoke().unwrap();
    late.revoke().unwrap();
    let summary = lp.run().unwrap();

    assert!(late.is_revoked());
    assert!(!late.is_delivered());
    assert_eq!(idler.status(), ActivityState::Running);
    assert_eq!(summary.final_turnstamp.time, Time::ZERO);

    let closing = handle.new_interrupt(Subject::Activity(idler.id()), Some("closing".to_owned()));
    handle
        .schedule(idler.task(), Some(closing.clone()), Some(Time::from(5_i64)))
        .unwrap();
    let summary = lp.run().unwrap();

    assert_eq!(idler.status(), ActivityState::Cancelled);
    assert_eq!(summary.final_turnstamp.time, Time::from(5_i64));
    assert_eq!(
        closing.revoke(),
        Err(InterruptError::AlreadyDelivered { interrupt: closing.id() })
    );
}

#[test]
fn run_summary_serializes_for_reports() {
    let mut lp = Loop::new(LoopConfig::default());
    lp.spawn(async {
        sleep(Time::from(4_i64)).await?;
        Ok(())
    });
    let summary = lp.run().unwrap();

    let json = serde_json::to_value(summary).unwrap();
    assert_eq!(json["end_reason"], "idle");
    assert_eq!(json["turns"], summary.turns);
    assert_eq!(json["dispatched"], summary.dispatched);
    assert_eq!(json["activities_spawned"], 1);
    assert_eq!(json["final_turnstamp"]["turn"], summary.final_turnstamp.turn);
}
