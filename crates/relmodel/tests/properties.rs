//! Property tests: whatever sequence of edits is applied, fixup leaves every
//! dependent consistent with its foreign key.

mod common;

use proptest::prelude::*;
use relmodel::prelude::*;

use common::{category_product, create_with_id};

const CATEGORY_IDS: [i32; 2] = [1, 2];
const PRODUCT_IDS: [i32; 3] = [10, 11, 12];

#[derive(Debug, Clone)]
enum Edit {
    SetForeignKey { product: usize, category: Option<usize> },
    SetReference { product: usize, category: Option<usize> },
    AddToCollection { category: usize, product: usize },
    RemoveFromCollection { category: usize, product: usize },
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    let product = 0..PRODUCT_IDS.len();
    let category = 0..CATEGORY_IDS.len();
    prop_oneof![
        (product.clone(), proptest::option::of(category.clone()))
            .prop_map(|(product, category)| Edit::SetForeignKey { product, category }),
        (product.clone(), proptest::option::of(category.clone()))
            .prop_map(|(product, category)| Edit::SetReference { product, category }),
        (category.clone(), product.clone())
            .prop_map(|(category, product)| Edit::AddToCollection { category, product }),
        (category, product)
            .prop_map(|(category, product)| Edit::RemoveFromCollection { category, product }),
    ]
}

/// A link-setting edit: `(product, category)`.
fn arb_link() -> impl Strategy<Value = (usize, usize, u8)> {
    (0..PRODUCT_IDS.len(), 0..CATEGORY_IDS.len(), 0..3_u8)
}

struct Fixture {
    session: Session,
    categories: Vec<ObjectId>,
    products: Vec<ObjectId>,
}

fn fixture() -> Fixture {
    let mut session = Session::new(category_product(false, None));
    let categories: Vec<ObjectId> = CATEGORY_IDS
        .iter()
        .map(|&id| create_with_id(&mut session, "Category", id))
        .collect();
    let products: Vec<ObjectId> = PRODUCT_IDS
        .iter()
        .map(|&id| create_with_id(&mut session, "Product", id))
        .collect();
    session
        .attach_range(categories.iter().chain(&products).copied())
        .expect("attach fixture");
    Fixture {
        session,
        categories,
        products,
    }
}

impl Fixture {
    fn apply_raw(&mut self, edit: &Edit) {
        let graph = self.session.graph_mut();
        match *edit {
            Edit::SetForeignKey { product, category } => {
                let value = category.map_or(Value::Null, |c| Value::Int(CATEGORY_IDS[c]));
                graph.set(self.products[product], "CategoryId", value).unwrap();
            }
            Edit::SetReference { product, category } => {
                let target = category.map(|c| self.categories[c]);
                graph.set_reference(self.products[product], "Category", target).unwrap();
            }
            Edit::AddToCollection { category, product } => {
                let (owner, item) = (self.categories[category], self.products[product]);
                let present = graph
                    .collection(owner, "Products")
                    .unwrap()
                    .is_some_and(|items| items.contains(&item));
                if !present {
                    graph.collection_add(owner, "Products", item).unwrap();
                }
            }
            Edit::RemoveFromCollection { category, product } => {
                let (owner, item) = (self.categories[category], self.products[product]);
                graph.collection_remove(owner, "Products", item).unwrap();
            }
        }
    }

    /// Foreign key, reference and collection membership of every product.
    fn shape(&self) -> Vec<(Value, Option<ObjectId>, Vec<bool>)> {
        let graph = self.session.graph();
        self.products
            .iter()
            .map(|&p| {
                let fk = graph.get(p, "CategoryId").unwrap().clone();
                let reference = graph.reference(p, "Category").unwrap();
                let membership = self
                    .categories
                    .iter()
                    .map(|&c| {
                        graph
                            .collection(c, "Products")
                            .unwrap()
                            .is_some_and(|items| items.contains(&p))
                    })
                    .collect();
                (fk, reference, membership)
            })
            .collect()
    }

    fn assert_consistent(&self) -> std::result::Result<(), TestCaseError> {
        for (i, (fk, reference, membership)) in self.shape().into_iter().enumerate() {
            let linked = CATEGORY_IDS
                .iter()
                .position(|&id| fk.same_as(&Value::Int(id)));
            match linked {
                Some(c) => {
                    prop_assert_eq!(reference, Some(self.categories[c]), "product {}", i);
                    for (other, member) in membership.iter().enumerate() {
                        prop_assert_eq!(*member, other == c, "product {} in category {}", i, other);
                    }
                }
                None => {
                    prop_assert_eq!(&fk, &Value::Null, "product {}", i);
                    prop_assert_eq!(reference, None, "product {}", i);
                    prop_assert!(!membership.iter().any(|m| *m), "product {} in a collection", i);
                }
            }
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn sweep_leaves_every_dependent_consistent(edits in prop::collection::vec(arb_edit(), 0..12)) {
        let mut fx = fixture();
        for edit in &edits {
            fx.apply_raw(edit);
        }
        fx.session.detect_changes().unwrap();
        fx.assert_consistent()?;

        let before = fx.shape();
        fx.session.detect_changes().unwrap();
        prop_assert_eq!(fx.shape(), before);
    }

    #[test]
    fn notifying_setters_keep_the_last_link(links in prop::collection::vec(arb_link(), 1..12)) {
        let mut fx = fixture();
        let mut expected: Vec<Option<usize>> = vec![None; PRODUCT_IDS.len()];
        for &(product, category, how) in &links {
            let (p, c) = (fx.products[product], fx.categories[category]);
            match how {
                0 => fx.session.set_value(p, "CategoryId", CATEGORY_IDS[category]).unwrap(),
                1 => fx.session.set_reference(p, "Category", Some(c)).unwrap(),
                _ => fx.session.add_to_collection(c, "Products", p).unwrap(),
            }
            expected[product] = Some(category);
        }
        fx.assert_consistent()?;

        for (i, (fk, _, _)) in fx.shape().into_iter().enumerate() {
            let want = expected[i].map_or(Value::Null, |c| Value::Int(CATEGORY_IDS[c]));
            prop_assert_eq!(fk, want, "product {}", i);
        }
    }
}
