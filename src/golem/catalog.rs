use super::{PrimitiveType, Type, TypeTag};
use serde::Deserialize;
use std::collections::HashMap;

//
// Public Interface
//

/// Hidden per-instance field recording the exact runtime type.
pub const CLASS_IDENTIFIER_FIELD: &str = "@class_identifier";
/// Hidden per-instance monitor word.
pub const LOCK_FIELD: &str = "@lock";
/// Base-chain entry marking a type as enum-like.
pub const ENUM_MARKER: &str = "Enum";
pub const ARRAY_LENGTH_FIELD: &str = "length";
pub const ARRAY_DATA_FIELD: &str = "data";

#[derive(Clone, Debug, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: Type,
}

/// The layout of one struct tag. Field names starting with `@` denote
/// base-class sub-objects, except for the internal bookkeeping fields
/// `@class_identifier` and `@lock`. An `element_type` marks an array shape
/// (a struct with a `length` field and a `data` pointer field).
#[derive(Clone, Debug, Deserialize)]
pub struct ClassShape {
    pub tag: TypeTag,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub ancestors: Vec<TypeTag>,
    #[serde(default)]
    pub type_params: Vec<String>,
    #[serde(default)]
    pub element_type: Option<Type>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub post_init_method: Option<String>,
}

/// Read-only map from qualified type tags to their shapes. Owned by the
/// caller and never mutated during a materialization call.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(from = "CatalogFile")]
pub struct Catalog {
    classes: HashMap<TypeTag, ClassShape>,
}

//
// Private Implementation
//

#[derive(Deserialize)]
struct CatalogFile {
    classes: Vec<ClassShape>,
}

impl From<CatalogFile> for Catalog {
    fn from(file: CatalogFile) -> Self {
        let mut catalog = Catalog::new();
        for shape in file.classes {
            catalog.insert(shape);
        }
        catalog
    }
}

impl ClassShape {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_array(&self) -> bool {
        self.element_type.is_some()
    }

    pub fn is_enum(&self) -> bool {
        self.ancestors.iter().any(|a| a == ENUM_MARKER)
    }

    /// String-likeness is recognized structurally, not by name: an `int`
    /// length field next to a `*char` data field.
    pub fn is_string_like(&self) -> bool {
        let length_ok = self
            .field(ARRAY_LENGTH_FIELD)
            .map_or(false, |f| f.typ == Type::int());
        let data_ok = self.field(ARRAY_DATA_FIELD).map_or(false, |f| {
            f.typ == Type::pointer_to(Type::Primitive(PrimitiveType::Char))
        });
        length_ok && data_ok && !self.is_array()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, shape: ClassShape) {
        self.classes.insert(shape.tag.clone(), shape);
    }

    pub fn lookup(&self, tag: &str) -> Option<&ClassShape> {
        self.classes.get(tag)
    }

    /// Catalog contents are trusted; asking for an unknown tag is a
    /// programming error in the caller.
    pub fn shape(&self, tag: &str) -> &ClassShape {
        self.lookup(tag)
            .unwrap_or_else(|| panic!("type `{}` is not in the catalog", tag))
    }

    pub fn is_array(&self, tag: &str) -> bool {
        self.lookup(tag).map_or(false, ClassShape::is_array)
    }

    pub fn is_enum(&self, tag: &str) -> bool {
        self.lookup(tag).map_or(false, ClassShape::is_enum)
    }

    pub fn is_string_like(&self, tag: &str) -> bool {
        self.lookup(tag).map_or(false, ClassShape::is_string_like)
    }

    /// Byte size of a type, where defined. Dynamic allocation requires one.
    pub fn size_of(&self, typ: &Type) -> Option<u64> {
        match typ {
            Type::Primitive(p) => Some(p.size_in_bytes()),
            Type::Pointer(_) => Some(8),
            Type::Struct { tag, .. } => self.lookup(tag).and_then(|s| s.size),
            Type::Void | Type::Param(_) => None,
        }
    }

    pub fn array_tag(element: &Type) -> TypeTag {
        format!("array[{}]", element)
    }

    /// Registers the canonical array shape for `element` and returns its tag.
    /// Reference elements are stored through an untyped data pointer and cast
    /// at the access site.
    pub fn define_array(&mut self, element: Type) -> TypeTag {
        let tag = Self::array_tag(&element);
        if self.classes.contains_key(&tag) {
            return tag;
        }
        let data_type = if element.is_pointer() {
            Type::pointer_to(Type::Void)
        } else {
            Type::pointer_to(element.clone())
        };
        self.insert(ClassShape {
            tag: tag.clone(),
            fields: vec![
                Field {
                    name: ARRAY_LENGTH_FIELD.to_string(),
                    typ: Type::int(),
                },
                Field {
                    name: ARRAY_DATA_FIELD.to_string(),
                    typ: data_type,
                },
            ],
            ancestors: Vec::new(),
            type_params: Vec::new(),
            element_type: Some(element),
            size: None,
            post_init_method: None,
        });
        tag
    }

    /// Name of the idempotent static-initializer wrapper of an enum class.
    pub fn static_init_wrapper(tag: &str) -> String {
        format!("{}::static_init_wrapper", tag)
    }

    /// Name of the synthesized ordered constants table of an enum class.
    pub fn constants_table_name(tag: &str) -> String {
        format!("{}::$constants", tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_shape() -> ClassShape {
        ClassShape {
            tag: "String".to_string(),
            fields: vec![
                Field {
                    name: ARRAY_LENGTH_FIELD.to_string(),
                    typ: Type::int(),
                },
                Field {
                    name: ARRAY_DATA_FIELD.to_string(),
                    typ: Type::pointer_to(Type::Primitive(PrimitiveType::Char)),
                },
            ],
            ancestors: Vec::new(),
            type_params: Vec::new(),
            element_type: None,
            size: Some(16),
            post_init_method: None,
        }
    }

    #[test]
    fn string_likeness_is_structural() {
        let mut catalog = Catalog::new();
        catalog.insert(string_shape());
        assert!(catalog.is_string_like("String"));

        let mut broken = string_shape();
        broken.tag = "NotQuite".to_string();
        broken.fields.remove(1);
        catalog.insert(broken);
        assert!(!catalog.is_string_like("NotQuite"));
    }

    #[test]
    fn array_shapes_are_synthesized_once() {
        let mut catalog = Catalog::new();
        let tag = catalog.define_array(Type::int());
        assert_eq!(tag, "array[int]");
        assert!(catalog.is_array(&tag));
        assert_eq!(catalog.define_array(Type::int()), tag);
        let shape = catalog.shape(&tag);
        assert_eq!(shape.element_type, Some(Type::int()));
        assert_eq!(
            shape.field(ARRAY_DATA_FIELD).unwrap().typ,
            Type::pointer_to(Type::int())
        );
    }

    #[test]
    fn reference_arrays_use_an_untyped_data_pointer() {
        let mut catalog = Catalog::new();
        let tag = catalog.define_array(Type::pointer_to(Type::struct_tag("Point")));
        assert_eq!(
            catalog.shape(&tag).field(ARRAY_DATA_FIELD).unwrap().typ,
            Type::pointer_to(Type::Void)
        );
    }

    #[test]
    fn enum_recognition_follows_the_base_chain() {
        let mut catalog = Catalog::new();
        catalog.insert(ClassShape {
            tag: "Color".to_string(),
            fields: vec![Field {
                name: "ordinal".to_string(),
                typ: Type::int(),
            }],
            ancestors: vec![ENUM_MARKER.to_string()],
            type_params: Vec::new(),
            element_type: None,
            size: Some(8),
            post_init_method: None,
        });
        assert!(catalog.is_enum("Color"));
        assert!(!catalog.is_enum("Unknown"));
    }

    #[test]
    fn catalog_deserializes_from_json() {
        let text = r#"{
            "classes": [
                {"tag": "Point", "size": 8, "fields": [
                    {"name": "x", "type": "int"},
                    {"name": "y", "type": "int"}
                ]}
            ]
        }"#;
        let catalog: Catalog = serde_json::from_str(text).unwrap();
        let shape = catalog.shape("Point");
        assert_eq!(shape.fields.len(), 2);
        assert_eq!(shape.fields[0].typ, Type::int());
        assert_eq!(catalog.size_of(&Type::struct_tag("Point")), Some(8));
    }
}
