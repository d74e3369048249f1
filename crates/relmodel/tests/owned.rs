//! Owned entity types: tracking with the owner, displacement, detaching and
//! instances shared between owned types.

mod common;

use relmodel::PendingOp;
use relmodel::prelude::*;

use common::{create_with_id, order_addresses};

const SHIPPING: &str = "Order.ShippingAddress#Address";
const BILLING: &str = "Order.BillingAddress#Address";

fn order_with_shipping(session: &mut Session, id: i32) -> (ObjectId, ObjectId) {
    let order = create_with_id(session, "Order", id);
    let address = session.create("Address").unwrap();
    session.graph_mut().set(address, "Street", "Main St").unwrap();
    session
        .graph_mut()
        .set_reference(order, "ShippingAddress", Some(address))
        .unwrap();
    (order, address)
}

#[test]
fn owned_reference_is_tracked_with_its_owner() {
    let mut session = Session::new(order_addresses());
    let (order, address) = order_with_shipping(&mut session, 1);
    session.attach(order).unwrap();

    let entry = session.entry(address).unwrap();
    assert_eq!(entry.entity_type_name(), SHIPPING);
    assert_eq!(entry.state(), EntityState::Unchanged);
    assert_eq!(entry.current_value("OrderId").unwrap(), Value::Int(1));
    assert!(entry.key().is_some());
}

#[test]
fn untracked_owned_instance_has_no_entry() {
    let mut session = Session::new(order_addresses());
    let address = session.create("Address").unwrap();

    let err = session.entry(address).unwrap_err();
    match err {
        Error::UntrackedDependent(e) => {
            assert_eq!(e.class, "Address");
            assert!(e.entity_types.iter().any(|t| t == SHIPPING));
            assert!(e.entity_types.iter().any(|t| t == BILLING));
        }
        other => panic!("expected UntrackedDependent, got {other:?}"),
    }
}

#[test]
fn replacing_owned_instance_shares_identity() {
    let mut session = Session::new(order_addresses());
    let (order, old) = order_with_shipping(&mut session, 1);
    session.attach(order).unwrap();

    let new = session.create("Address").unwrap();
    session.graph_mut().set(new, "Street", "Side St").unwrap();
    session.set_reference(order, "ShippingAddress", Some(new)).unwrap();

    {
        let entry = session.entry(new).unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert_eq!(entry.current_value("OrderId").unwrap(), Value::Int(1));
        let displaced = entry.shared_identity_entry().expect("shared identity");
        assert_eq!(displaced.object(), old);
        assert_eq!(displaced.state(), EntityState::Deleted);
    }

    // the displaced entry is only reachable through its partner
    let listed: Vec<ObjectId> = session
        .entries()
        .unwrap()
        .iter()
        .map(EntryRef::object)
        .collect();
    assert!(listed.contains(&new));
    assert!(!listed.contains(&old));

    // one row, rewritten in place
    let plan = session.flush_plan().unwrap();
    assert_eq!(plan.len(), 1);
    match &plan.updates[0] {
        PendingOp::Update {
            entity_type,
            key_values,
            set_columns,
            set_values,
            ..
        } => {
            assert_eq!(entity_type, SHIPPING);
            assert_eq!(key_values, &vec![Value::Int(1)]);
            assert_eq!(set_columns, &vec!["Street".to_string()]);
            assert_eq!(set_values, &vec![Value::from("Side St")]);
        }
        other => panic!("expected an update, got {other:?}"),
    }
}

#[test]
fn replacing_owned_instance_in_snapshot_mode() {
    let mut session = Session::new(order_addresses());
    let (order, old) = order_with_shipping(&mut session, 1);
    session.attach(order).unwrap();

    let new = session.create("Address").unwrap();
    session
        .graph_mut()
        .set_reference(order, "ShippingAddress", Some(new))
        .unwrap();
    session.detect_changes().unwrap();

    let entry = session.entry(new).unwrap();
    assert_eq!(entry.state(), EntityState::Added);
    assert_eq!(
        entry.shared_identity_entry().map(|e| e.state()),
        Some(EntityState::Deleted)
    );
    assert_eq!(entry.shared_identity_entry().map(|e| e.object()), Some(old));
}

#[test]
fn added_owned_instance_moves_to_new_owner() {
    let mut session = Session::new(order_addresses());
    let (first, address) = order_with_shipping(&mut session, 1);
    let second = create_with_id(&mut session, "Order", 2);
    session.add(first).unwrap();
    session.add(second).unwrap();

    session
        .set_reference(second, "ShippingAddress", Some(address))
        .unwrap();

    assert_eq!(session.graph().reference(first, "ShippingAddress").unwrap(), None);
    assert_eq!(
        session.graph().reference(second, "ShippingAddress").unwrap(),
        Some(address)
    );
    let entry = session.entry(address).unwrap();
    assert_eq!(entry.state(), EntityState::Added);
    assert_eq!(entry.current_value("OrderId").unwrap(), Value::Int(2));
}

#[test]
fn unchanged_owned_instance_cannot_change_owner() {
    let mut session = Session::new(order_addresses());
    let (first, address) = order_with_shipping(&mut session, 1);
    let second = create_with_id(&mut session, "Order", 2);
    session.attach(first).unwrap();
    session.attach(second).unwrap();

    let err = session
        .set_reference(second, "ShippingAddress", Some(address))
        .unwrap_err();
    match err {
        Error::KeyReadOnly(e) => {
            assert_eq!(e.entity_type, SHIPPING);
            assert_eq!(e.property, "OrderId");
        }
        other => panic!("expected KeyReadOnly, got {other:?}"),
    }
}

#[test]
fn detaching_owner_detaches_owned_entries() {
    let mut session = Session::new(order_addresses());
    let (order, address) = order_with_shipping(&mut session, 1);
    session.attach(order).unwrap();

    session.detach(order).unwrap();

    assert_eq!(session.entries().unwrap().len(), 0);
    assert!(matches!(
        session.entry(address),
        Err(Error::UntrackedDependent(_))
    ));
    assert_eq!(
        session.graph().reference(order, "ShippingAddress").unwrap(),
        Some(address)
    );
}

#[test]
fn deferred_detach_of_owned_entries_happens_in_cascade_changes() {
    let config = TrackerConfig::default().cascade_delete_timing(CascadeTiming::OnSaveChanges);
    let mut session = Session::with_config(order_addresses(), config);
    let (order, address) = order_with_shipping(&mut session, 1);
    session.attach(order).unwrap();

    session.detach(order).unwrap();
    assert_eq!(
        session.reference_entry(order, "ShippingAddress").unwrap().map(|e| e.state()),
        Some(EntityState::Unchanged)
    );

    session.cascade_changes().unwrap();
    assert!(session.entries().unwrap().is_empty());
    assert!(matches!(
        session.entry(address),
        Err(Error::UntrackedDependent(_))
    ));
}

#[test]
fn instance_shared_by_two_owned_types_is_ambiguous() {
    let mut session = Session::new(order_addresses());
    let (order, address) = order_with_shipping(&mut session, 1);
    session
        .graph_mut()
        .set_reference(order, "BillingAddress", Some(address))
        .unwrap();
    session.attach(order).unwrap();

    match session.entry(address) {
        Err(Error::AmbiguousDependent(e)) => {
            assert_eq!(e.class, "Address");
            assert_eq!(e.entity_types.len(), 2);
        }
        other => panic!("expected AmbiguousDependent, got {other:?}"),
    }

    let shipping = session
        .reference_entry(order, "ShippingAddress")
        .unwrap()
        .expect("shipping entry");
    assert_eq!(shipping.entity_type_name(), SHIPPING);
    assert_eq!(shipping.state(), EntityState::Unchanged);

    let billing = session
        .reference_entry(order, "BillingAddress")
        .unwrap()
        .expect("billing entry");
    assert_eq!(billing.entity_type_name(), BILLING);
    assert_eq!(billing.object(), address);
}

#[test]
fn duplicate_dependent_can_be_an_error() {
    let config = TrackerConfig::default().duplicate_dependent(WarningBehavior::Throw);
    let mut session = Session::with_config(order_addresses(), config);
    let (order, address) = order_with_shipping(&mut session, 1);
    session
        .graph_mut()
        .set_reference(order, "BillingAddress", Some(address))
        .unwrap();

    let err = session.attach(order).unwrap_err();
    match err {
        Error::DuplicateDependent(e) => {
            assert_eq!(e.entity_type, BILLING);
            assert_eq!(e.other_entity_type, SHIPPING);
        }
        other => panic!("expected DuplicateDependent, got {other:?}"),
    }
}

#[test]
fn owner_delete_cascades_to_owned_entries() {
    let mut session = Session::new(order_addresses());
    let (order, address) = order_with_shipping(&mut session, 1);
    session.attach(order).unwrap();

    session.remove(order).unwrap();

    let entry = session
        .reference_entry(order, "ShippingAddress")
        .unwrap()
        .expect("shipping entry");
    assert_eq!(entry.state(), EntityState::Deleted);
    assert_eq!(entry.object(), address);
}

#[test]
fn owner_key_reaches_every_level_of_ownership() {
    let model = ModelBuilder::new()
        .entity(
            EntityDef::new("Blog")
                .property(PropertyDef::new("Id").generated())
                .key(&["Id"])
                .owns(
                    OwnedDef::reference("Settings", "Settings")
                        .property(PropertyDef::new("Theme").nullable())
                        .owns(
                            OwnedDef::reference("Sub", "Sub")
                                .property(PropertyDef::new("Flag").nullable()),
                        ),
                ),
        )
        .build()
        .unwrap();
    let mut session = Session::new(std::sync::Arc::new(model));
    let blog = session.create("Blog").unwrap();
    let settings = session.create("Settings").unwrap();
    let sub = session.create("Sub").unwrap();
    session.graph_mut().set_reference(blog, "Settings", Some(settings)).unwrap();
    session.graph_mut().set_reference(settings, "Sub", Some(sub)).unwrap();
    session.add(blog).unwrap();

    {
        let entry = session.entry(sub).unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert!(entry.is_temporary("BlogId").unwrap());
    }

    session.set_value(blog, "Id", 5).unwrap();

    for obj in [settings, sub] {
        let entry = session.entry(obj).unwrap();
        assert_eq!(entry.current_value("BlogId").unwrap(), Value::Int(5));
        assert!(!entry.is_temporary("BlogId").unwrap());
        assert_eq!(entry.key().map(|k| k.values().to_vec()), Some(vec![Value::Int(5)]));
    }
}
