use golem::golem::catalog::{Catalog, ClassShape, Field};
use golem::golem::{write_program, InstrBlock, Type};

#[allow(dead_code)]
pub fn shape(tag: &str, fields: Vec<(&str, Type)>, size: u64) -> ClassShape {
    ClassShape {
        tag: tag.to_string(),
        fields: fields
            .into_iter()
            .map(|(name, typ)| Field {
                name: name.to_string(),
                typ,
            })
            .collect(),
        ancestors: Vec::new(),
        type_params: Vec::new(),
        element_type: None,
        size: Some(size),
        post_init_method: None,
    }
}

#[allow(dead_code)]
pub fn point_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.insert(shape(
        "Point",
        vec![("x", Type::int()), ("y", Type::int())],
        8,
    ));
    catalog
}

pub fn render(block: &InstrBlock) -> String {
    let mut buffer = Vec::new();
    write_program(block, &mut buffer).expect("writing to a vector cannot fail");
    String::from_utf8(buffer).expect("listing is valid utf-8")
}
