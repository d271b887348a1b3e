#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use ckernel::{
    Escalation, FunctionDescriptor, ManagedObject, ManagedObjectDescriptor, ManagedObjectUser,
    ManualClock, ObjectIndex, ValueObject,
    object::{
        AsynchronousContext, AsynchronousManagedObject, CoordinatingManagedObject, IdlePool,
        ObjectRegistry,
    },
};
use common::{CompletionSlot, Journal, passive_office};
use core::{any::Any, time::Duration};
use parking_lot::Mutex;
use std::sync::Arc;

/// Client wired to the port of a separately sourced configuration object.
#[derive(Default)]
struct Client {
    port: Option<u16>,
}

impl ManagedObject for Client {
    fn object(&mut self) -> &mut dyn Any {
        self
    }

    fn coordinating(&mut self) -> Option<&mut dyn CoordinatingManagedObject> {
        Some(self)
    }
}

impl CoordinatingManagedObject for Client {
    fn load_objects(&mut self, registry: &mut ObjectRegistry<'_>) -> Result<(), Escalation> {
        assert_eq!(registry.len(), 1);
        self.port = Some(*registry.object::<u16>(0)?);
        Ok(())
    }
}

fn client() -> ManagedObjectDescriptor {
    ManagedObjectDescriptor::new("client", |user: ManagedObjectUser| {
        user.set_object(Client::default());
    })
    .depends_on(ObjectIndex::function(0))
}

#[test]
fn coordinating_object_receives_its_dependencies_before_use() {
    let office = passive_office().build().unwrap();
    let journal = Journal::default();
    let ran = journal.clone();
    let connect = FunctionDescriptor::builder("connect", move |context| {
        let port =
            context.with_object(ObjectIndex::function(1), |client: &mut Client| client.port)?;
        ran.record(format!("port:{port:?}"));
        Ok(())
    })
    .function_object(ManagedObjectDescriptor::new("port", |user: ManagedObjectUser| {
        user.set_object(ValueObject(8080_u16));
    }))
    .function_object(client())
    .build();

    let process = office.invoke_process(&connect, None, None);

    assert!(process.is_complete());
    assert_eq!(journal.events(), ["port:Some(8080)"]);
}

#[test]
fn failing_coordination_escalates_to_the_function() {
    let office = passive_office().build().unwrap();
    let journal = Journal::default();
    let handled = journal.clone();
    let handler = FunctionDescriptor::builder("handler", move |context| {
        let escalation = context.argument::<Escalation>().unwrap();
        handled.record(format!("handled:{}", escalation.kernel_error().is_some()));
        Ok(())
    })
    .build();
    let connect = FunctionDescriptor::builder("connect", |_| Ok(()))
        .function_object(ManagedObjectDescriptor::new("port", |user: ManagedObjectUser| {
            user.set_object(ValueObject("not a port"));
        }))
        .function_object(client())
        .escalation(ckernel::EscalationFlow::any(handler))
        .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&connect, None, completion.callback());

    assert!(process.is_complete());
    assert_eq!(journal.events(), ["handled:true"]);
    assert!(completion.take().unwrap().escalation.is_none());
}

/// Connection that reports itself busy until its handshake completes.
struct Handshaking {
    context: Arc<Mutex<Option<AsynchronousContext>>>,
}

impl ManagedObject for Handshaking {
    fn object(&mut self) -> &mut dyn Any {
        self
    }

    fn asynchronous(&mut self) -> Option<&mut dyn AsynchronousManagedObject> {
        Some(self)
    }
}

impl AsynchronousManagedObject for Handshaking {
    fn register_asynchronous_context(&mut self, context: AsynchronousContext) {
        context.start();
        *self.context.lock() = Some(context);
    }
}

#[test]
fn busy_asynchronous_object_delays_functions_until_ready() {
    let office = passive_office().build().unwrap();
    let handshake: Arc<Mutex<Option<AsynchronousContext>>> = Arc::default();
    let journal = Journal::default();
    let ran = journal.clone();
    let shared = handshake.clone();
    let send = FunctionDescriptor::builder("send", move |_| {
        ran.record("send");
        Ok(())
    })
    .function_object(ManagedObjectDescriptor::new("connection", move |user: ManagedObjectUser| {
        user.set_object(Handshaking {
            context: shared.clone(),
        });
    }))
    .build();

    let process = office.invoke_process(&send, None, None);

    assert!(journal.events().is_empty());
    assert!(!process.is_complete());
    let context = handshake.lock().clone().unwrap();
    assert!(context.is_in_progress());

    context.complete();

    assert!(!context.is_in_progress());
    assert_eq!(journal.events(), ["send"]);
    assert!(process.is_complete());
}

#[test]
fn object_delivered_after_sourcing_timeout_is_lost_to_its_pool() {
    let clock = Arc::new(ManualClock::new());
    let caught: Arc<Mutex<Vec<Escalation>>> = Arc::default();
    let catch_all = caught.clone();
    let office = passive_office()
        .clock(clock.clone())
        .catch_all(move |escalation, _process| catch_all.lock().push(escalation.clone()))
        .build()
        .unwrap();
    let deferred: Arc<Mutex<Option<ManagedObjectUser>>> = Arc::default();
    let parked = deferred.clone();
    let pool = Arc::new(IdlePool::new(
        move |user: ManagedObjectUser| *parked.lock() = Some(user),
        1,
    ));
    let journal = Journal::default();
    let ran = journal.clone();
    let query = FunctionDescriptor::builder("query", move |_| {
        ran.record("query");
        Ok(())
    })
    .function_object(
        ManagedObjectDescriptor::new("connection", |_user: ManagedObjectUser| {})
            .with_pool(pool.clone())
            .with_timeout(Duration::from_secs(2)),
    )
    .build();

    let process = office.invoke_process(&query, None, None);
    assert!(!process.is_complete());

    clock.advance(Duration::from_secs(2));
    office.check_on_assets();
    assert!(process.is_complete());
    assert_eq!(caught.lock().len(), 1);

    let user = deferred.lock().take().unwrap();
    user.set_object(ValueObject(String::from("connection")));

    assert!(journal.events().is_empty());
    assert_eq!(pool.lost_count(), 1);
    assert_eq!(pool.idle_count(), 0);
}
