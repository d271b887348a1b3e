#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use ckernel::{
    Escalation, FunctionDescriptor, Governance, GovernanceDeactivationStrategy,
    GovernanceDescriptor, GovernanceState, ManagedObjectDescriptor, ManagedObjectUser, ObjectIndex,
    OfficeConfig, ValueObject,
    governance::RegistrationId, object::ExtensionExtractor,
};
use common::{CompletionSlot, passive_office};
use parking_lot::Mutex;
use std::sync::Arc;

/// Account row a transaction governs.
struct Account {
    name: &'static str,
}

#[derive(Debug, Default)]
struct Ledger {
    registered: Vec<(RegistrationId, &'static str)>,
    unregistered: Vec<RegistrationId>,
    enforced: usize,
    disregarded: usize,
}

struct Transaction {
    ledger: Arc<Mutex<Ledger>>,
    fail_enforce: bool,
}

impl Governance<&'static str> for Transaction {
    fn register_governed(
        &mut self,
        id: RegistrationId,
        extension: &'static str,
    ) -> Result<(), Escalation> {
        self.ledger.lock().registered.push((id, extension));
        Ok(())
    }

    fn unregister_governed(&mut self, id: RegistrationId) -> Result<(), Escalation> {
        self.ledger.lock().unregistered.push(id);
        Ok(())
    }

    fn enforce(&mut self) -> Result<(), Escalation> {
        self.ledger.lock().enforced += 1;
        if self.fail_enforce {
            return Err(Escalation::msg("commit rejected"));
        }
        Ok(())
    }

    fn disregard(&mut self) -> Result<(), Escalation> {
        self.ledger.lock().disregarded += 1;
        Ok(())
    }
}

fn transaction(ledger: &Arc<Mutex<Ledger>>, fail_enforce: bool) -> GovernanceDescriptor {
    let ledger = ledger.clone();
    GovernanceDescriptor::new::<&'static str, _, _>("tx", move || Transaction {
        ledger: ledger.clone(),
        fail_enforce,
    })
}

fn account(name: &'static str) -> ManagedObjectDescriptor {
    ManagedObjectDescriptor::new(name, move |user: ManagedObjectUser| {
        user.set_object(ValueObject(Account { name }));
    })
    .with_extension(ExtensionExtractor::new::<Account, _, _>(
        0,
        |account: &mut Account| account.name,
    ))
}

#[test]
fn deactivation_unregisters_both_objects_after_failed_enforcement() {
    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let office = passive_office()
        .governance(transaction(&ledger, true))
        .thread_object(account("alice"))
        .thread_object(account("bob"))
        .build()
        .unwrap();
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();
    let transfer = FunctionDescriptor::builder("transfer", move |context| {
        seen.lock().push(context.governance_state(0));
        Ok(())
    })
    .govern(0, true)
    .require_object(ObjectIndex::thread(0))
    .require_object(ObjectIndex::thread(1))
    .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&transfer, None, completion.callback());

    assert!(process.is_complete());
    assert_eq!(*states.lock(), [Some(GovernanceState::Active)]);
    let ledger = ledger.lock();
    let registered: Vec<_> = ledger.registered.iter().map(|(_, name)| *name).collect();
    assert_eq!(registered, ["alice", "bob"]);
    assert_eq!(ledger.enforced, 1);
    assert_eq!(ledger.disregarded, 0);
    let ids: Vec<_> = ledger.registered.iter().map(|(id, _)| *id).collect();
    assert_eq!(ledger.unregistered, ids);

    let completion = completion.take().unwrap();
    assert!(completion.escalation.is_none());
    assert_eq!(completion.cleanup_escalations.len(), 1);
    let cleanup = &completion.cleanup_escalations[0];
    assert_eq!(&*cleanup.source, "tx");
    assert_eq!(cleanup.escalation.to_string(), "commit rejected");
}

#[test]
fn function_requiring_inactive_governance_deactivates_it() {
    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let office = passive_office()
        .config(
            OfficeConfig::default()
                .with_deactivation_strategy(GovernanceDeactivationStrategy::Disregard),
        )
        .governance(transaction(&ledger, false))
        .thread_object(account("alice"))
        .build()
        .unwrap();
    let states = Arc::new(Mutex::new(Vec::new()));

    let after = states.clone();
    let report = FunctionDescriptor::builder("report", move |context| {
        after.lock().push(context.governance_state(0));
        Ok(())
    })
    .govern(0, false)
    .build();
    let before = states.clone();
    let update = FunctionDescriptor::builder("update", move |context| {
        before.lock().push(context.governance_state(0));
        Ok(())
    })
    .govern(0, true)
    .require_object(ObjectIndex::thread(0))
    .next(report)
    .build();
    let completion = CompletionSlot::default();

    let process = office.invoke_process(&update, None, completion.callback());

    assert!(process.is_complete());
    assert_eq!(
        *states.lock(),
        [Some(GovernanceState::Active), Some(GovernanceState::Inactive)]
    );
    let ledger = ledger.lock();
    assert_eq!(ledger.registered.len(), 1);
    assert_eq!(ledger.unregistered.len(), 1);
    assert_eq!(ledger.disregarded, 1);
    assert_eq!(ledger.enforced, 0);
    assert!(completion.take().unwrap().cleanup_escalations.is_empty());
}
