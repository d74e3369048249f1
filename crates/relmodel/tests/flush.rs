//! Flush plans: which writes a save would issue, and in what order.

mod common;

use relmodel::PendingOp;
use relmodel::prelude::*;

use common::{category_product, create_with_id, generated_category_product, state_of};

fn attached_pair(session: &mut Session) -> (ObjectId, ObjectId) {
    let category = create_with_id(session, "Category", 1);
    let product = create_with_id(session, "Product", 10);
    session.graph_mut().collection_add(category, "Products", product).unwrap();
    session.attach(category).unwrap();
    (category, product)
}

fn types(ops: &[PendingOp]) -> Vec<&str> {
    ops.iter().map(PendingOp::entity_type).collect()
}

#[test]
fn unchanged_session_has_nothing_to_write() {
    let mut session = Session::new(category_product(false, None));
    attached_pair(&mut session);
    assert!(session.flush_plan().unwrap().is_empty());
}

#[test]
fn modified_entry_updates_changed_columns_only() {
    let mut session = Session::new(category_product(false, None));
    let (_, product) = attached_pair(&mut session);

    session.set_value(product, "Name", "Lamp").unwrap();

    let plan = session.flush_plan().unwrap();
    assert_eq!(plan.len(), 1);
    match &plan.updates[0] {
        PendingOp::Update {
            entity_type,
            key_columns,
            key_values,
            set_columns,
            set_values,
            ..
        } => {
            assert_eq!(entity_type, "Product");
            assert_eq!(key_columns, &vec!["Id".to_string()]);
            assert_eq!(key_values, &vec![Value::Int(10)]);
            assert_eq!(set_columns, &vec!["Name".to_string()]);
            assert_eq!(set_values, &vec![Value::from("Lamp")]);
        }
        other => panic!("expected an update, got {other:?}"),
    }
}

#[test]
fn raw_edit_is_picked_up_by_the_plan() {
    let mut session = Session::new(category_product(false, None));
    let (_, product) = attached_pair(&mut session);

    session.graph_mut().set(product, "Name", "Desk").unwrap();

    let plan = session.flush_plan().unwrap();
    assert_eq!(plan.updates.len(), 1);
    assert!(plan.updates[0].is_update());
}

#[test]
fn removed_entry_is_deleted() {
    let mut session = Session::new(category_product(false, None));
    let (_, product) = attached_pair(&mut session);

    session.remove(product).unwrap();

    let plan = session.flush_plan().unwrap();
    assert_eq!(plan.len(), 1);
    match &plan.deletes[0] {
        PendingOp::Delete {
            entity_type,
            key_values,
            ..
        } => {
            assert_eq!(entity_type, "Product");
            assert_eq!(key_values, &vec![Value::Int(10)]);
        }
        other => panic!("expected a delete, got {other:?}"),
    }
}

#[test]
fn added_dependent_is_inserted_with_every_column() {
    let mut session = Session::new(category_product(false, None));
    let (category, _) = attached_pair(&mut session);
    let fresh = create_with_id(&mut session, "Product", 11);
    session.add_to_collection(category, "Products", fresh).unwrap();

    let plan = session.flush_plan().unwrap();
    assert_eq!(plan.len(), 1);
    match &plan.inserts[0] {
        PendingOp::Insert { columns, values, .. } => {
            assert_eq!(columns, &vec!["Id", "CategoryId", "Name"]);
            assert_eq!(values, &vec![Value::Int(11), Value::Int(1), Value::Null]);
        }
        other => panic!("expected an insert, got {other:?}"),
    }
}

#[test]
fn temporary_keys_are_left_out_of_inserts() {
    let mut session = Session::new(generated_category_product());
    let category = session.create("Category").unwrap();
    let product = session.create("Product").unwrap();
    session.graph_mut().collection_add(category, "Products", product).unwrap();
    session.add(category).unwrap();

    let plan = session.flush_plan().unwrap();
    assert_eq!(types(&plan.inserts), vec!["Category", "Product"]);
    match &plan.inserts[0] {
        PendingOp::Insert { columns, .. } => assert_eq!(columns, &vec!["Value1"]),
        other => panic!("expected an insert, got {other:?}"),
    }
    match &plan.inserts[1] {
        PendingOp::Insert { columns, .. } => {
            assert_eq!(columns, &vec!["CategoryId", "Name"]);
        }
        other => panic!("expected an insert, got {other:?}"),
    }
}

#[test]
fn cascade_delete_writes_dependents_first() {
    let mut session = Session::new(category_product(true, None));
    let (category, _) = attached_pair(&mut session);
    let other = create_with_id(&mut session, "Product", 12);
    session.graph_mut().set(other, "CategoryId", 1).unwrap();
    session.attach(other).unwrap();

    session.remove(category).unwrap();

    let plan = session.flush_plan().unwrap();
    assert_eq!(types(&plan.deletes), vec!["Product", "Product", "Category"]);
    let batches = relmodel::FlushPlan::batch_by_type(&plan.deletes);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 2);
}

#[test]
fn accepting_changes_empties_the_plan() {
    let mut session = Session::new(category_product(false, None));
    let (category, product) = attached_pair(&mut session);
    let fresh = create_with_id(&mut session, "Product", 11);
    session.add_to_collection(category, "Products", fresh).unwrap();
    session.remove(product).unwrap();

    session.accept_all_changes().unwrap();

    assert!(session.flush_plan().unwrap().is_empty());
    assert_eq!(state_of(&mut session, fresh), EntityState::Unchanged);
    assert_eq!(state_of(&mut session, product), EntityState::Detached);
    assert!(!session.has_changes().unwrap());
}

#[test]
fn plan_serializes_for_logging() {
    let mut session = Session::new(category_product(false, None));
    let (_, product) = attached_pair(&mut session);
    session.set_value(product, "Name", "Lamp").unwrap();

    let plan = session.flush_plan().unwrap();
    let json = serde_json::to_value(&plan).unwrap();

    assert_eq!(json["deletes"], serde_json::json!([]));
    assert_eq!(json["inserts"], serde_json::json!([]));
    let update = &json["updates"][0]["Update"];
    assert_eq!(update["entity_type"], "Product");
    assert_eq!(update["set_columns"], serde_json::json!(["Name"]));
    assert_eq!(update["set_values"], serde_json::json!([{ "Text": "Lamp" }]));
}
