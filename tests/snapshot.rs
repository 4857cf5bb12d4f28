use golem::golem::catalog::{Catalog, ClassShape, Field};
use golem::golem::snapshot::{assign_from_snapshot, SnapshotError};
use golem::golem::symbol::SymbolTable;
use golem::golem::{Expr, InstrBlock, ObjectFactoryOptions, Type};
use serde_json::json;
use std::io::Write;

mod common;

fn replay(
    catalog: &Catalog,
    target: &Expr,
    value: &serde_json::Value,
) -> Result<InstrBlock, SnapshotError> {
    let mut symbols = SymbolTable::new();
    let mut out = InstrBlock::new();
    assign_from_snapshot(
        target,
        value,
        &mut out,
        &mut symbols,
        catalog,
        &ObjectFactoryOptions::default(),
    )?;
    Ok(out)
}

#[test]
fn point_snapshot_assigns_exactly_the_fields() {
    let catalog = common::point_catalog();
    let target = Expr::symbol("obj", Type::struct_tag("Point"));
    let block = replay(&catalog, &target, &json!({"x": 3, "y": 4})).unwrap();
    assert_eq!(common::render(&block), "obj.x := 3\nobj.y := 4\n");
}

#[test]
fn aliased_subtrees_share_one_storage_symbol() {
    let mut catalog = common::point_catalog();
    catalog.insert(common::shape(
        "Pair",
        vec![
            ("a", Type::pointer_to(Type::struct_tag("Point"))),
            ("b", Type::pointer_to(Type::struct_tag("Point"))),
        ],
        16,
    ));
    let target = Expr::symbol("pair", Type::struct_tag("Pair"));
    let block = replay(
        &catalog,
        &target,
        &json!({
            "a": {"@id": "shared", "x": 1, "y": 2},
            "b": {"@ref": "shared"}
        }),
    )
    .unwrap();
    let listing = common::render(&block);
    assert!(listing.contains("pair.a := main::alloc_site$1"));
    assert!(listing.contains("pair.b := main::alloc_site$1"));
    // the canonical node is materialized once
    assert_eq!(listing.matches("zero(Point, Point)").count(), 1);
}

#[test]
fn enum_replay_calls_the_initializer_then_indexes_the_table() {
    let mut catalog = Catalog::new();
    catalog.insert(ClassShape {
        tag: "Color".to_string(),
        fields: vec![Field {
            name: "ordinal".to_string(),
            typ: Type::int(),
        }],
        ancestors: vec!["Enum".to_string()],
        type_params: Vec::new(),
        element_type: None,
        size: Some(8),
        post_init_method: None,
    });
    let target = Expr::symbol("c", Type::pointer_to(Type::struct_tag("Color")));
    let block = replay(&catalog, &target, &json!({"ordinal": "2"})).unwrap();
    let listing = common::render(&block);
    let call_at = listing
        .find("call Color::static_init_wrapper()")
        .expect("initializer call");
    let index_at = listing
        .find("Color::$constants.data[2]")
        .expect("constants table index");
    assert!(call_at < index_at);
}

#[test]
fn nested_arrays_thread_the_element_type_hint() {
    let mut catalog = common::point_catalog();
    let points = catalog.define_array(Type::pointer_to(Type::Void));
    let block = replay(
        &catalog,
        &Expr::symbol("cells", Type::pointer_to(Type::struct_tag(&points))),
        &json!({
            "@type": "array[*Point]",
            "@items": [{"x": 1, "y": 2}]
        }),
    )
    .unwrap();
    let listing = common::render(&block);
    // the untyped data pointer is cast to the hinted element type before use
    assert!(listing.contains("(**Point)"));
    assert!(listing.contains("zero(Point, Point)"));
}

#[test]
fn snapshot_replay_is_idempotent() {
    let mut catalog = common::point_catalog();
    catalog.define_array(Type::int());
    catalog.insert(common::shape(
        "Holder",
        vec![
            ("p", Type::pointer_to(Type::struct_tag("Point"))),
            ("data", Type::pointer_to(Type::struct_tag("array[int]"))),
        ],
        16,
    ));
    let value = json!({
        "p": {"x": 5, "y": 6},
        "data": {"@items": [1, 2, 3], "@nondetLength": true}
    });
    let target = Expr::symbol("h", Type::struct_tag("Holder"));
    let first = replay(&catalog, &target, &value).unwrap();
    let second = replay(&catalog, &target, &value).unwrap();
    assert_eq!(common::render(&first), common::render(&second));
}

#[test]
fn character_quirk_survives_a_file_round_trip() {
    let mut catalog = Catalog::new();
    catalog.insert(common::shape(
        "Letter",
        vec![("c", "char".parse().unwrap())],
        2,
    ));
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"{"c": "0041"}"#).unwrap();
    let value: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(file.path()).unwrap()).unwrap();
    let target = Expr::symbol("l", Type::struct_tag("Letter"));
    let block = replay(&catalog, &target, &value).unwrap();
    assert_eq!(common::render(&block), "l.c := 65\n");
}

#[test]
fn malformed_array_nodes_fail_loudly() {
    let mut catalog = Catalog::new();
    let tag = catalog.define_array(Type::int());
    let target = Expr::symbol("arr", Type::pointer_to(Type::struct_tag(&tag)));
    let result = replay(&catalog, &target, &json!({"@nondetLength": true}));
    assert!(matches!(result, Err(SnapshotError::MissingItems(_))));
}
