#![allow(dead_code)]

use std::sync::Arc;

use relmodel::prelude::*;
use relmodel::{Graph, ObjectId};

/// Category (1) -> (*) Product through `Product.CategoryId`.
///
/// `Category.Products` / `Product.Category` are the navigations. Both keys are
/// assigned by the caller.
pub fn category_product(required: bool, on_delete: Option<DeleteBehavior>) -> Arc<Model> {
    let fk = if required {
        PropertyDef::new("CategoryId")
    } else {
        PropertyDef::new("CategoryId").nullable()
    };
    let mut relationship = RelationshipDef::one_to_many("Category", "Product")
        .principal_navigation("Products")
        .dependent_navigation("Category")
        .foreign_key(&["CategoryId"]);
    if let Some(behavior) = on_delete {
        relationship = relationship.on_delete(behavior);
    }
    let model = ModelBuilder::new()
        .entity(
            EntityDef::new("Category")
                .property(PropertyDef::new("Id"))
                .property(PropertyDef::new("Value1").nullable())
                .property(PropertyDef::new("Value2").nullable())
                .key(&["Id"]),
        )
        .entity(
            EntityDef::new("Product")
                .property(PropertyDef::new("Id"))
                .property(fk)
                .property(PropertyDef::new("Name").nullable())
                .key(&["Id"]),
        )
        .relationship(relationship)
        .build()
        .expect("category/product model");
    Arc::new(model)
}

/// Same shape with store-generated keys on both sides.
pub fn generated_category_product() -> Arc<Model> {
    let model = ModelBuilder::new()
        .entity(
            EntityDef::new("Category")
                .property(PropertyDef::new("Id").generated())
                .property(PropertyDef::new("Value1").nullable())
                .key(&["Id"]),
        )
        .entity(
            EntityDef::new("Product")
                .property(PropertyDef::new("Id").generated())
                .property(PropertyDef::new("CategoryId").nullable())
                .property(PropertyDef::new("Name").nullable())
                .key(&["Id"]),
        )
        .relationship(
            RelationshipDef::one_to_many("Category", "Product")
                .principal_navigation("Products")
                .dependent_navigation("Category")
                .foreign_key(&["CategoryId"]),
        )
        .build()
        .expect("generated category/product model");
    Arc::new(model)
}

/// Order owning two references of the shared class `Address`.
pub fn order_addresses() -> Arc<Model> {
    let model = ModelBuilder::new()
        .entity(
            EntityDef::new("Order")
                .property(PropertyDef::new("Id"))
                .key(&["Id"])
                .owns(
                    OwnedDef::reference("ShippingAddress", "Address")
                        .property(PropertyDef::new("Street").nullable()),
                )
                .owns(
                    OwnedDef::reference("BillingAddress", "Address")
                        .property(PropertyDef::new("Street").nullable()),
                ),
        )
        .build()
        .expect("order/address model");
    Arc::new(model)
}

/// Post (*) <-> (*) Tag through the explicit join entity PostTag.
pub fn posts_and_tags() -> Arc<Model> {
    let model = ModelBuilder::new()
        .entity(EntityDef::new("Post").property(PropertyDef::new("Id")).key(&["Id"]))
        .entity(EntityDef::new("Tag").property(PropertyDef::new("Id")).key(&["Id"]))
        .entity(
            EntityDef::new("PostTag")
                .property(PropertyDef::new("PostId"))
                .property(PropertyDef::new("TagId"))
                .property(PropertyDef::new("Note").nullable())
                .key(&["PostId", "TagId"]),
        )
        .relationship(
            RelationshipDef::one_to_many("Post", "PostTag")
                .principal_navigation("PostTags")
                .dependent_navigation("Post")
                .foreign_key(&["PostId"]),
        )
        .relationship(
            RelationshipDef::one_to_many("Tag", "PostTag")
                .principal_navigation("PostTags")
                .dependent_navigation("Tag")
                .foreign_key(&["TagId"]),
        )
        .build()
        .expect("post/tag model");
    Arc::new(model)
}

/// Create an instance and set its `Id` field.
pub fn create_with_id(session: &mut Session, class: &str, id: i32) -> ObjectId {
    let obj = session.create(class).expect("create instance");
    session.graph_mut().set(obj, "Id", id).expect("set Id");
    obj
}

/// Assert that `product` is linked to `category` from every side.
pub fn assert_linked(graph: &Graph, category: ObjectId, product: ObjectId, key: i32) {
    assert_eq!(
        graph.get(product, "CategoryId").expect("CategoryId"),
        &Value::Int(key)
    );
    assert_eq!(
        graph.reference(product, "Category").expect("Category"),
        Some(category)
    );
    assert_eq!(
        graph.collection(category, "Products").expect("Products"),
        Some(vec![product])
    );
}

pub fn state_of(session: &mut Session, obj: ObjectId) -> EntityState {
    session.entry(obj).expect("entry").state()
}
