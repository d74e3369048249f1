//! Fixup must reach the same graph whatever side of a relationship is set
//! and whatever order the instances are tracked in.

mod common;

use relmodel::prelude::*;

use common::{category_product, create_with_id, state_of};

const CATEGORY_ID: i32 = 77;
const PRODUCT_ID: i32 = 78;

#[derive(Debug, Clone, Copy)]
struct Combo {
    set_fk: bool,
    set_to_principal: bool,
    set_to_dependent: bool,
}

fn combos() -> impl Iterator<Item = Combo> {
    (0..8_u8).map(|bits| Combo {
        set_fk: bits & 1 != 0,
        set_to_principal: bits & 2 != 0,
        set_to_dependent: bits & 4 != 0,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// Links are set on the untracked graph, then both instances are tracked.
    Prebuilt,
    /// Both instances are tracked, then links are set through the session.
    Notify,
    /// Both instances are tracked, then links are written raw and swept.
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Track {
    Attach,
    Add,
}

fn track(session: &mut Session, how: Track, obj: ObjectId) {
    match how {
        Track::Attach => session.attach(obj),
        Track::Add => session.add(obj),
    }
    .expect("track instance");
}

fn set_links_raw(session: &mut Session, combo: Combo, category: ObjectId, product: ObjectId) {
    let graph = session.graph_mut();
    if combo.set_fk {
        graph.set(product, "CategoryId", CATEGORY_ID).unwrap();
    }
    if combo.set_to_principal {
        graph.set_reference(product, "Category", Some(category)).unwrap();
    }
    if combo.set_to_dependent {
        graph.collection_add(category, "Products", product).unwrap();
    }
}

fn set_links_notifying(session: &mut Session, combo: Combo, category: ObjectId, product: ObjectId) {
    if combo.set_fk {
        session.set_value(product, "CategoryId", CATEGORY_ID).unwrap();
    }
    if combo.set_to_principal {
        session.set_reference(product, "Category", Some(category)).unwrap();
    }
    if combo.set_to_dependent {
        session.add_to_collection(category, "Products", product).unwrap();
    }
}

fn check(
    session: &mut Session,
    label: &str,
    category: ObjectId,
    product: ObjectId,
    expected: (EntityState, EntityState),
) {
    let graph = session.graph();
    assert_eq!(
        graph.get(product, "CategoryId").unwrap(),
        &Value::Int(CATEGORY_ID),
        "{label}: foreign key"
    );
    assert_eq!(
        graph.reference(product, "Category").unwrap(),
        Some(category),
        "{label}: dependent navigation"
    );
    assert_eq!(
        graph.collection(category, "Products").unwrap(),
        Some(vec![product]),
        "{label}: principal navigation"
    );
    assert_eq!(state_of(session, category), expected.0, "{label}: principal state");
    assert_eq!(state_of(session, product), expected.1, "{label}: dependent state");
}

fn run_case(mode: Mode, how: Track, combo: Combo, principal_first: bool) {
    let label = format!("{mode:?}/{how:?}/{combo:?}/principal_first={principal_first}");
    let mut session = Session::new(category_product(false, None));
    let category = create_with_id(&mut session, "Category", CATEGORY_ID);
    let product = create_with_id(&mut session, "Product", PRODUCT_ID);

    if mode == Mode::Prebuilt {
        set_links_raw(&mut session, combo, category, product);
    }
    let order = if principal_first {
        [category, product]
    } else {
        [product, category]
    };
    for obj in order {
        track(&mut session, how, obj);
    }
    match mode {
        Mode::Prebuilt => {}
        Mode::Notify => set_links_notifying(&mut session, combo, category, product),
        Mode::Sweep => {
            set_links_raw(&mut session, combo, category, product);
            session.detect_changes().unwrap();
        }
    }

    let expected = match (mode, how) {
        (Mode::Prebuilt, Track::Attach) => (EntityState::Unchanged, EntityState::Unchanged),
        (Mode::Prebuilt, Track::Add) => (EntityState::Added, EntityState::Added),
        _ => (EntityState::Unchanged, EntityState::Modified),
    };
    check(&mut session, &label, category, product, expected);

    for _ in 0..3 {
        session.detect_changes().unwrap();
    }
    check(&mut session, &format!("{label} (after repeated sweeps)"), category, product, expected);
}

#[test]
fn fixup_is_order_independent() {
    for combo in combos().filter(|c| c.set_fk || c.set_to_principal || c.set_to_dependent) {
        for principal_first in [true, false] {
            run_case(Mode::Prebuilt, Track::Attach, combo, principal_first);
            run_case(Mode::Prebuilt, Track::Add, combo, principal_first);
            run_case(Mode::Notify, Track::Attach, combo, principal_first);
            run_case(Mode::Sweep, Track::Attach, combo, principal_first);
        }
    }
}

#[test]
fn nothing_set_leaves_instances_unrelated() {
    for principal_first in [true, false] {
        let mut session = Session::new(category_product(false, None));
        let category = create_with_id(&mut session, "Category", CATEGORY_ID);
        let product = create_with_id(&mut session, "Product", PRODUCT_ID);
        let order = if principal_first {
            [category, product]
        } else {
            [product, category]
        };
        for obj in order {
            session.attach(obj).unwrap();
        }
        session.detect_changes().unwrap();

        let graph = session.graph();
        assert_eq!(graph.get(product, "CategoryId").unwrap(), &Value::Null);
        assert_eq!(graph.reference(product, "Category").unwrap(), None);
        assert_eq!(graph.collection(category, "Products").unwrap(), None);
        assert!(!session.has_changes().unwrap());
    }
}

#[test]
fn foreign_key_points_at_untracked_principal_until_it_arrives() {
    let mut session = Session::new(category_product(false, None));
    let category = create_with_id(&mut session, "Category", CATEGORY_ID);
    let product = create_with_id(&mut session, "Product", PRODUCT_ID);
    session.graph_mut().set(product, "CategoryId", CATEGORY_ID).unwrap();

    session.attach(product).unwrap();
    assert_eq!(session.graph().reference(product, "Category").unwrap(), None);

    session.attach(category).unwrap();
    common::assert_linked(session.graph(), category, product, CATEGORY_ID);
    assert!(!session.has_changes().unwrap());
}

#[test]
fn later_write_wins_in_snapshot_mode() {
    let mut session = Session::new(category_product(false, None));
    let first = create_with_id(&mut session, "Category", 1);
    let second = create_with_id(&mut session, "Category", 2);
    let product = create_with_id(&mut session, "Product", 10);
    session.attach_range([first, second, product]).unwrap();

    // navigation first, FK last: the FK decides
    session.graph_mut().set_reference(product, "Category", Some(first)).unwrap();
    session.graph_mut().set(product, "CategoryId", 2).unwrap();
    session.detect_changes().unwrap();
    common::assert_linked(session.graph(), second, product, 2);
    assert_eq!(session.graph().collection(first, "Products").unwrap(), Some(vec![]));

    // collection last: the collection decides
    session.graph_mut().set(product, "CategoryId", 2).unwrap();
    session.graph_mut().collection_add(first, "Products", product).unwrap();
    session.detect_changes().unwrap();
    common::assert_linked(session.graph(), first, product, 1);
    assert_eq!(session.graph().collection(second, "Products").unwrap(), Some(vec![]));
}

#[test]
fn sweep_keeps_raw_members_queued_behind_an_earlier_fixup() {
    let mut session = Session::new(category_product(false, None));
    let category = create_with_id(&mut session, "Category", 2);
    let first = create_with_id(&mut session, "Product", 10);
    let second = create_with_id(&mut session, "Product", 11);
    session.attach_range([category, first, second]).unwrap();

    // fixup of the FK adds `second` to the same collection `first` was
    // raw-added to afterwards
    session.graph_mut().set(second, "CategoryId", 2).unwrap();
    session.graph_mut().collection_add(category, "Products", first).unwrap();
    session.detect_changes().unwrap();

    let graph = session.graph();
    assert_eq!(graph.get(first, "CategoryId").unwrap(), &Value::Int(2));
    assert_eq!(graph.reference(first, "Category").unwrap(), Some(category));
    assert_eq!(graph.get(second, "CategoryId").unwrap(), &Value::Int(2));
    assert_eq!(graph.reference(second, "Category").unwrap(), Some(category));
    let mut members = graph.collection(category, "Products").unwrap().unwrap();
    members.sort_unstable();
    let mut expected = vec![first, second];
    expected.sort_unstable();
    assert_eq!(members, expected);
    assert_eq!(state_of(&mut session, first), EntityState::Modified);

    // nothing left over for a later sweep
    session.detect_changes().unwrap();
    assert_eq!(session.graph().get(first, "CategoryId").unwrap(), &Value::Int(2));
}
