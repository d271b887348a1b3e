#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use ckernel::{
    AsynchronousFlow, FlowDescriptor, FlowOutcome, FunctionDescriptor, ManagedObjectDescriptor,
    ManagedObjectUser, ObjectIndex, ValueObject,
    object::{IdlePool, ManagedObjectInterest, RecycleParameter},
};
use common::{CompletionSlot, Journal, passive_office};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

fn value_source(value: u32) -> impl Fn(ManagedObjectUser) + Send + Sync + 'static {
    move |user: ManagedObjectUser| user.set_object(ValueObject(value))
}

#[test]
fn synchronous_process_completes_without_cleanup() {
    let office = passive_office().build().unwrap();
    let journal = Journal::default();
    let ran = journal.clone();
    let hello = FunctionDescriptor::builder("hello", move |_| {
        ran.record("hello");
        Ok(())
    })
    .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&hello, None, completion.callback());

    assert!(process.is_complete());
    assert_eq!(journal.events(), ["hello"]);
    let completion = completion.take().unwrap();
    assert_eq!(completion.process, process.id());
    assert_eq!(completion.cleanup_jobs, 0);
    assert!(completion.escalation.is_none());
    assert!(completion.cleanup_escalations.is_empty());
    assert!(!completion.cancelled);
}

#[test]
fn next_function_receives_next_argument() {
    let office = passive_office().build().unwrap();
    let journal = Journal::default();
    let seen = journal.clone();
    let second = FunctionDescriptor::builder("second", move |context| {
        let value = context.take_argument::<u32>().unwrap();
        seen.record(format!("second:{value}"));
        Ok(())
    })
    .build();
    let first = FunctionDescriptor::builder("first", |context| {
        let value = *context.argument::<u32>().unwrap();
        context.set_next_argument(value + 1);
        Ok(())
    })
    .next(second)
    .build();

    let process = office.invoke_process(&first, Some(Box::new(41_u32)), None);

    assert!(process.is_complete());
    assert_eq!(journal.events(), ["second:42"]);
}

#[test]
fn flow_completes_once_before_the_next_function() {
    let office = passive_office().build().unwrap();
    let journal = Journal::default();

    let flow_journal = journal.clone();
    let branch = FunctionDescriptor::builder("branch", move |_| {
        flow_journal.record("branch");
        Ok(())
    })
    .build();
    let next_journal = journal.clone();
    let next = FunctionDescriptor::builder("next", move |_| {
        next_journal.record("next");
        Ok(())
    })
    .build();
    let callback_journal = journal.clone();
    let trigger = FunctionDescriptor::builder("trigger", move |context| {
        let journal = callback_journal.clone();
        context.do_flow(
            0,
            None,
            Some(Box::new(move |outcome: FlowOutcome| {
                assert!(outcome.is_completed(), "{outcome:?}");
                journal.record("callback");
            })),
        )
    })
    .flow(FlowDescriptor::new(branch))
    .next(next)
    .build();

    let process = office.invoke_process(&trigger, None, None);

    assert!(process.is_complete());
    let events = journal.events();
    assert_eq!(journal.count("callback"), 1);
    let branch_at = events.iter().position(|event| event == "branch").unwrap();
    let next_at = events.iter().position(|event| event == "next").unwrap();
    assert!(branch_at < next_at, "{events:?}");
}

#[test]
fn spawned_flow_runs_in_its_own_thread_state() {
    let office = passive_office().build().unwrap();
    let journal = Journal::default();
    let threads = Arc::new(Mutex::new(Vec::new()));

    let child_threads = threads.clone();
    let child = FunctionDescriptor::builder("child", move |context| {
        child_threads.lock().push(context.thread_id());
        Ok(())
    })
    .build();
    let parent_threads = threads.clone();
    let callback_journal = journal.clone();
    let parent = FunctionDescriptor::builder("parent", move |context| {
        parent_threads.lock().push(context.thread_id());
        let journal = callback_journal.clone();
        context.do_flow(
            0,
            None,
            Some(Box::new(move |outcome: FlowOutcome| {
                journal.record(format!("spawned:{}", outcome.is_completed()));
            })),
        )
    })
    .flow(FlowDescriptor::new(child).spawn_thread_state())
    .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&parent, None, completion.callback());

    assert!(process.is_complete());
    assert!(completion.is_filled());
    assert_eq!(journal.events(), ["spawned:true"]);
    let threads = threads.lock();
    assert_eq!(threads.len(), 2);
    assert_ne!(threads[0], threads[1]);
}

#[test]
fn recycle_functions_run_one_after_the_other() {
    let pending: Arc<Mutex<Vec<AsynchronousFlow>>> = Arc::default();
    let journal = Journal::default();

    let recycle_pending = pending.clone();
    let recycle_journal = journal.clone();
    let recycle = FunctionDescriptor::builder("recycle", move |context| {
        let parameter = context.take_argument::<RecycleParameter>().unwrap();
        recycle_journal.record(format!("recycle:{}", parameter.bound_name()));
        recycle_pending.lock().push(context.create_asynchronous_flow());
        Ok(())
    })
    .build();
    let user = FunctionDescriptor::builder("user", |_| Ok(()))
        .function_object(
            ManagedObjectDescriptor::new("a", value_source(1)).with_recycle(recycle.clone()),
        )
        .function_object(ManagedObjectDescriptor::new("b", value_source(2)).with_recycle(recycle))
        .build();
    let office = passive_office().build().unwrap();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&user, None, completion.callback());

    assert_eq!(journal.events(), ["recycle:a"]);
    assert!(!process.is_complete());

    let first = pending.lock().pop().unwrap();
    first.complete();
    assert_eq!(journal.events(), ["recycle:a", "recycle:b"]);
    assert!(!process.is_complete());

    let second = pending.lock().pop().unwrap();
    second.complete();
    assert!(process.is_complete());
    assert_eq!(completion.take().unwrap().cleanup_jobs, 2);
}

#[test]
fn recycled_pooled_object_is_reused() {
    let sourced = Arc::new(AtomicUsize::new(0));
    let counter = sourced.clone();
    let pool = Arc::new(IdlePool::new(
        move |user: ManagedObjectUser| {
            counter.fetch_add(1, Ordering::Relaxed);
            user.set_object(ValueObject(String::from("connection")));
        },
        1,
    ));
    let recycle = FunctionDescriptor::builder("recycle", |context| {
        let mut parameter = context.take_argument::<RecycleParameter>().unwrap();
        assert!(parameter.is_pooled());
        assert_eq!(parameter.object::<String>().map(|object| object.as_str()), Some("connection"));
        assert!(parameter.reuse());
        Ok(())
    })
    .build();
    let user = FunctionDescriptor::builder("user", |context| {
        context.with_object(ObjectIndex::function(0), |connection: &mut String| {
            assert_eq!(connection.as_str(), "connection");
        })
    })
    .function_object(
        ManagedObjectDescriptor::new("connection", |_user: ManagedObjectUser| {})
            .with_pool(pool.clone())
            .with_recycle(recycle),
    )
    .build();
    let office = passive_office().build().unwrap();

    let first = office.invoke_process(&user, None, None);
    assert!(first.is_complete());
    assert_eq!(pool.idle_count(), 1);

    let second = office.invoke_process(&user, None, None);
    assert!(second.is_complete());
    assert_eq!(sourced.load(Ordering::Relaxed), 1);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.lost_count(), 0);
}

#[test]
fn interest_delays_unload_and_process_completion() {
    let interest: Arc<Mutex<Option<ManagedObjectInterest>>> = Arc::default();
    let journal = Journal::default();

    let recycle_journal = journal.clone();
    let recycle = FunctionDescriptor::builder("recycle", move |_| {
        recycle_journal.record("recycled");
        Ok(())
    })
    .build();
    let holder = interest.clone();
    let user = FunctionDescriptor::builder("user", move |context| {
        *holder.lock() = Some(context.register_interest(ObjectIndex::function(0))?);
        Ok(())
    })
    .function_object(ManagedObjectDescriptor::new("cache", value_source(3)).with_recycle(recycle))
    .build();
    let office = passive_office().build().unwrap();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&user, None, completion.callback());

    assert!(journal.events().is_empty());
    assert!(!process.is_complete());
    assert!(!completion.is_filled());

    let released = interest.lock().take().unwrap();
    assert_eq!(&**released.bound_name(), "cache");
    drop(released);

    assert_eq!(journal.events(), ["recycled"]);
    assert!(process.is_complete());
    assert_eq!(completion.take().unwrap().cleanup_jobs, 1);
}

#[test]
fn cancellation_cancels_pending_flows() {
    let pending: Arc<Mutex<Vec<AsynchronousFlow>>> = Arc::default();
    let journal = Journal::default();

    let waiting = pending.clone();
    let stalled = FunctionDescriptor::builder("stalled", move |context| {
        waiting.lock().push(context.create_asynchronous_flow());
        Ok(())
    })
    .build();
    let never_journal = journal.clone();
    let never = FunctionDescriptor::builder("never", move |_| {
        never_journal.record("never");
        Ok(())
    })
    .build();
    let callback_journal = journal.clone();
    let trigger = FunctionDescriptor::builder("trigger", move |context| {
        let journal = callback_journal.clone();
        context.do_flow(
            0,
            None,
            Some(Box::new(move |outcome: FlowOutcome| {
                journal.record(format!("{outcome:?}"));
            })),
        )
    })
    .flow(FlowDescriptor::new(stalled))
    .next(never)
    .build();
    let office = passive_office().build().unwrap();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&trigger, None, completion.callback());
    assert!(!process.is_complete());
    assert_eq!(pending.lock().len(), 1);

    process.cancel();

    assert!(process.is_cancelled());
    assert!(process.is_complete());
    assert_eq!(journal.events(), ["Cancelled"]);
    assert!(completion.take().unwrap().cancelled);

    // Completing the abandoned operation afterwards is harmless.
    pending.lock().pop().unwrap().complete();
    assert_eq!(journal.count("never"), 0);
}
