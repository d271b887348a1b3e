#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use ckernel::{
    AsynchronousFlow, Escalation, EscalationFlow, FunctionDescriptor, KernelError,
    ManagedObjectDescriptor, ManagedObjectUser, ManualClock, ObjectIndex, OfficeConfig, ValueObject,
    asset::{Asset, AssetCheck, AssetManager, AwaitOutcome, LatchedWork},
};
use common::{CompletionSlot, Journal, passive_office};
use core::time::Duration;
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};

#[test]
fn function_resumes_once_asynchronous_source_delivers() {
    let clock = Arc::new(ManualClock::new());
    let office = passive_office().clock(clock.clone()).build().unwrap();
    let deferred: Arc<Mutex<Option<ManagedObjectUser>>> = Arc::default();
    let journal = Journal::default();

    let parked = deferred.clone();
    let ran = journal.clone();
    let reader = FunctionDescriptor::builder("reader", move |context| {
        let value = context.with_object(ObjectIndex::function(0), |value: &mut u64| *value)?;
        ran.record(format!("read:{value}"));
        Ok(())
    })
    .function_object(ManagedObjectDescriptor::new(
        "remote",
        move |user: ManagedObjectUser| {
            *parked.lock() = Some(user);
        },
    ))
    .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&reader, None, completion.callback());

    assert!(journal.events().is_empty());
    assert!(!process.is_complete());

    let user = deferred.lock().take().unwrap();
    assert_eq!(&**user.bound_name(), "remote");
    user.set_object(ValueObject(7_u64));
    clock.advance(Duration::from_millis(10));
    office.check_on_assets();

    assert_eq!(journal.events(), ["read:7"]);
    assert!(process.is_complete());
    assert!(completion.take().unwrap().escalation.is_none());
}

#[test]
fn sourcing_timeout_escalates_to_the_office() {
    let clock = Arc::new(ManualClock::new());
    let caught: Arc<Mutex<Vec<Escalation>>> = Arc::default();
    let catch_all = caught.clone();
    let office = passive_office()
        .clock(clock.clone())
        .config(OfficeConfig::default().with_sourcing_timeout(Duration::from_secs(5)))
        .catch_all(move |escalation, _process| catch_all.lock().push(escalation.clone()))
        .build()
        .unwrap();
    let reader = FunctionDescriptor::builder("reader", |_| Ok(()))
        .function_object(ManagedObjectDescriptor::new("never", |_user: ManagedObjectUser| {}))
        .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&reader, None, completion.callback());

    clock.advance(Duration::from_secs(4));
    office.check_on_assets();
    assert!(!process.is_complete());
    assert!(caught.lock().is_empty());

    clock.advance(Duration::from_secs(1));
    office.check_on_assets();

    assert!(process.is_complete());
    let caught = caught.lock();
    assert_eq!(caught.len(), 1);
    assert!(matches!(
        caught[0].kernel_error(),
        Some(KernelError::SourceTimedOut { bound_name }) if &**bound_name == "never"
    ));
    let completion = completion.take().unwrap();
    assert!(completion.escalation.is_some());
    assert!(completion.cancelled);
}

#[test]
fn asynchronous_operation_timeout_fails_the_function() {
    let clock = Arc::new(ManualClock::new());
    let office = passive_office().clock(clock.clone()).build().unwrap();
    let pending: Arc<Mutex<Vec<AsynchronousFlow>>> = Arc::default();
    let journal = Journal::default();

    let handled = journal.clone();
    let handler = FunctionDescriptor::builder("timed-out", move |context| {
        let escalation = context.argument::<Escalation>().unwrap();
        assert!(matches!(
            escalation.kernel_error(),
            Some(KernelError::AsynchronousOperationTimedOut { .. })
        ));
        handled.record("handled");
        Ok(())
    })
    .build();
    let never = journal.clone();
    let next = FunctionDescriptor::builder("next", move |_| {
        never.record("next");
        Ok(())
    })
    .build();
    let waiting = pending.clone();
    let slow = FunctionDescriptor::builder("slow", move |context| {
        waiting.lock().push(context.create_asynchronous_flow());
        Ok(())
    })
    .asynchronous_timeout(Duration::from_secs(1))
    .escalation(EscalationFlow::of::<KernelError>(handler))
    .next(next)
    .build();

    let process = office.invoke_process(&slow, None, None);

    clock.advance(Duration::from_millis(999));
    office.check_on_assets();
    assert!(journal.events().is_empty());

    clock.advance(Duration::from_millis(1));
    office.check_on_assets();

    assert_eq!(journal.events(), ["handled"]);
    assert!(process.is_complete());

    // Completing after the timeout changes nothing.
    pending.lock().pop().unwrap().complete();
    assert_eq!(journal.events(), ["handled"]);
}

#[test]
fn asynchronous_operation_completed_in_time_continues() {
    let office = passive_office().build().unwrap();
    let pending: Arc<Mutex<Vec<AsynchronousFlow>>> = Arc::default();
    let state = Arc::new(Mutex::new(0_u32));

    let waiting = pending.clone();
    let slow = FunctionDescriptor::builder("slow", move |context| {
        let mut waiting = waiting.lock();
        waiting.push(context.create_asynchronous_flow());
        waiting.push(context.create_asynchronous_flow());
        Ok(())
    })
    .build();

    let process = office.invoke_process(&slow, None, None);

    let first = pending.lock().pop().unwrap();
    let updated = state.clone();
    first.complete_with(move || *updated.lock() += 1);
    assert!(!process.is_complete());

    let second = pending.lock().pop().unwrap();
    second.complete();
    assert!(process.is_complete());
    assert_eq!(*state.lock(), 1);
}

struct Deadline {
    due: Instant,
}

impl Asset for Deadline {
    fn check_on_asset(&self, check: &mut AssetCheck<'_>) {
        if check.time() >= self.due {
            check.fail_functions(Escalation::msg("deadline passed"), true);
        }
    }
}

struct Waiter(Arc<Mutex<Vec<&'static str>>>);

impl LatchedWork for Waiter {
    fn resume(self: Box<Self>) {
        self.0.lock().push("resumed");
    }

    fn fail(self: Box<Self>, _escalation: Escalation) {
        self.0.lock().push("failed");
    }
}

#[test]
fn timed_out_monitor_fails_later_waiters_immediately() {
    let clock = Arc::new(ManualClock::new());
    let manager = AssetManager::new("deadlines", clock.clone());
    let due = manager.time() + Duration::from_secs(2);
    let monitor = manager.create_monitor(Arc::new(Deadline { due }));
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let waiter = outcomes.clone();
    assert!(matches!(
        monitor.await_on_asset(move || Box::new(Waiter(waiter))),
        AwaitOutcome::Latched
    ));
    clock.advance(Duration::from_secs(2));
    assert_eq!(manager.check_on_assets(), 1);
    assert_eq!(*outcomes.lock(), ["failed"]);

    let waiter = outcomes.clone();
    let late = monitor.await_on_asset(move || Box::new(Waiter(waiter)));
    assert!(matches!(
        late,
        AwaitOutcome::Failed(escalation) if escalation.to_string() == "deadline passed"
    ));
    assert_eq!(outcomes.lock().len(), 1);
    assert_eq!(monitor.waiting(), 0);
}
