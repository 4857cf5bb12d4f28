use super::allocate::Allocator;
use super::catalog::{Catalog, ClassShape, ARRAY_DATA_FIELD, CLASS_IDENTIFIER_FIELD, LOCK_FIELD};
use super::symbol::SymbolTable;
use super::{BinOp, Expr, Instr, InstrBlock, ObjectFactoryOptions, PrimitiveType, Type, TypeTag};
use log::warn;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

//
// Public Interface
//

/// Fully-qualified runtime type name; overrides inherited element-type hints.
pub const TYPE_KEY: &str = "@type";
/// Identity key marking the canonical, fully-populated occurrence.
pub const ID_KEY: &str = "@id";
/// Identity key marking a bare alias occurrence.
pub const REF_KEY: &str = "@ref";
/// Marks an array length as a lower bound rather than exact.
pub const NONDET_LENGTH_KEY: &str = "@nondetLength";
/// Element list of an array node.
pub const ITEMS_KEY: &str = "@items";
/// Wrapped scalar payload when a bare value would be ambiguous.
pub const VALUE_KEY: &str = "value";
/// Index into an enum's constants table.
pub const ORDINAL_KEY: &str = "ordinal";

/// A snapshot is a trusted, previously captured artifact; a node missing a
/// key its inferred case requires is a hard precondition failure.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("enum node for `{0}` lacks an `ordinal` field")]
    MissingOrdinal(TypeTag),

    #[error("array node for `{0}` has no element list")]
    MissingItems(TypeTag),

    #[error("reference node carries a non-string identity key")]
    MissingReferenceId,

    #[error("string-like `{0}` requires a bare text node")]
    NotAString(TypeTag),

    #[error("field data for `{0}` must be an object node")]
    ExpectedObject(TypeTag),

    #[error("cannot parse `{text}` as {kind}")]
    InvalidPrimitive { kind: &'static str, text: String },

    #[error("cannot materialize a snapshot node into `{0}`")]
    UnsupportedTarget(String),
}

/// Storage shared by all snapshot nodes carrying one identity key.
#[derive(Clone, Debug)]
pub struct ReferenceSlot {
    pub expr: Expr,
    /// For arrays, the symbol holding the shared length.
    pub array_length: Option<Expr>,
}

pub type ReferenceMap = HashMap<String, ReferenceSlot>;

/// Emits instructions assigning the captured value tree `value` to `expr`.
/// Declarations for created symbols precede the body in `out`.
pub fn assign_from_snapshot(
    expr: &Expr,
    value: &Value,
    out: &mut InstrBlock,
    symbols: &mut SymbolTable,
    catalog: &Catalog,
    options: &ObjectFactoryOptions,
) -> Result<(), SnapshotError> {
    let mut references = ReferenceMap::new();
    assign_from_snapshot_with_references(expr, value, out, symbols, catalog, options, &mut references)
}

/// Like `assign_from_snapshot`, but sharing the reference map with the
/// caller so aliases spanning several root assignments resolve to the same
/// storage.
#[allow(clippy::too_many_arguments)]
pub fn assign_from_snapshot_with_references(
    expr: &Expr,
    value: &Value,
    out: &mut InstrBlock,
    symbols: &mut SymbolTable,
    catalog: &Catalog,
    options: &ObjectFactoryOptions,
    references: &mut ReferenceMap,
) -> Result<(), SnapshotError> {
    let mut factory = SnapshotFactory {
        symbols,
        catalog,
        options,
        allocator: Allocator::new(&options.function_id),
        references,
    };
    let mut body = InstrBlock::new();
    time_debug!("snapshot materialization", {
        factory.assign_rec(&mut body, expr, value, None)
    })?;
    factory.allocator.declare_created(out);
    out.append(body);
    Ok(())
}

//
// Private Implementation
//

struct SnapshotFactory<'a> {
    symbols: &'a mut SymbolTable,
    catalog: &'a Catalog,
    options: &'a ObjectFactoryOptions,
    allocator: Allocator,
    references: &'a mut ReferenceMap,
}

fn has_key(value: &Value, key: &str) -> bool {
    value.as_object().map_or(false, |o| o.contains_key(key))
}

fn has_nondet_length(value: &Value) -> bool {
    value.get(NONDET_LENGTH_KEY).and_then(Value::as_bool) == Some(true)
}

/// Scalars arrive either as text or as plain JSON numbers.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Unwraps a `value`-wrapped scalar payload.
fn untyped_primitive(value: &Value) -> &Value {
    if has_key(value, VALUE_KEY) {
        value.get(VALUE_KEY).expect("checked key")
    } else {
        value
    }
}

impl<'a> SnapshotFactory<'a> {
    fn assign_rec(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
        type_from_array: Option<&str>,
    ) -> Result<(), SnapshotError> {
        let expr_type = expr.typ();
        match &expr_type {
            Type::Pointer(pointee) => {
                if json.is_null() {
                    block.assign(expr.clone(), Expr::null(expr_type.clone()));
                    return Ok(());
                }
                if has_key(json, ID_KEY) || has_key(json, REF_KEY) {
                    return self.assign_reference(block, expr, json, type_from_array);
                }
                if let Type::Struct { tag, .. } = pointee.as_ref() {
                    if self.catalog.is_array(tag) {
                        return self.assign_array(block, expr, json, None, type_from_array);
                    }
                }
                if let Some(tag) = self.replacement_tag(json, type_from_array, pointee) {
                    return self.assign_pointer_with_type(block, expr, json, &tag);
                }
                self.assign_pointer(block, expr, json)
            }
            // A struct-typed target was already materialized by the caller;
            // only its fields are assigned.
            Type::Struct { .. } => self.assign_struct_fields(block, expr, json),
            _ => self.assign_primitive(block, expr, untyped_primitive(json)),
        }
    }

    /// The runtime tag to materialize instead of the declared pointee, if
    /// one is given and differs. Unknown names warn and fall back to the
    /// declared type.
    fn replacement_tag(
        &self,
        json: &Value,
        type_from_array: Option<&str>,
        declared: &Type,
    ) -> Option<TypeTag> {
        let tag = if let Some(name) = json.get(TYPE_KEY).and_then(Value::as_str) {
            name.to_string()
        } else {
            let hint = type_from_array?;
            let parsed: Type = match hint.parse() {
                Ok(t) => t,
                Err(_) => {
                    warn!("unparseable element type hint `{}`", hint);
                    return None;
                }
            };
            match parsed {
                Type::Pointer(inner) => match *inner {
                    Type::Struct { tag, .. } => tag,
                    _ => return None,
                },
                Type::Struct { tag, .. } => tag,
                _ => return None,
            }
        };
        if self.catalog.lookup(&tag).is_none() {
            warn!(
                "unknown runtime type `{}` in snapshot, falling back to `{}`",
                tag, declared
            );
            return None;
        }
        match declared {
            Type::Struct { tag: declared_tag, .. } if *declared_tag == tag => None,
            _ => Some(tag),
        }
    }

    /// Materializes through a fresh pointer of the overriding runtime type,
    /// then assigns back with a cast.
    fn assign_pointer_with_type(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
        tag: &str,
    ) -> Result<(), SnapshotError> {
        let replacement = Type::pointer_to(Type::struct_tag(tag));
        let symbol = self
            .allocator
            .fresh(self.symbols, "det_subtype", replacement, false);
        self.assign_pointer(block, &symbol.expr(), json)?;
        block.assign(expr.clone(), symbol.expr().cast_to(expr.typ()));
        Ok(())
    }

    /// Pointer without identity or override: enum leaves are materialized
    /// through their constants table, everything else through a fresh
    /// dynamic object.
    fn assign_pointer(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
    ) -> Result<(), SnapshotError> {
        let pointee = expr.typ();
        let tag = match pointee.pointee() {
            Some(Type::Struct { tag, .. }) => tag.clone(),
            _ => return Err(SnapshotError::UnsupportedTarget(expr.typ().to_string())),
        };
        let catalog = self.catalog;
        let shape = catalog.shape(&tag);
        if shape.is_array() {
            return self.assign_array(block, expr, json, None, None);
        }
        if shape.is_enum() {
            return self.assign_enum(block, expr, json, &tag);
        }
        let site = self.allocator.allocate_dynamic_object(
            block,
            self.symbols,
            self.catalog,
            expr,
            &Type::struct_tag(&tag),
        );
        self.assign_struct(block, &Expr::deref(site), json)
    }

    /// Identity-bearing node: first touch allocates and registers storage
    /// before any recursion, so a node referring back to its own id
    /// terminates; the canonical occurrence fills in the data.
    fn assign_reference(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
        type_from_array: Option<&str>,
    ) -> Result<(), SnapshotError> {
        let id = json
            .get(ID_KEY)
            .or_else(|| json.get(REF_KEY))
            .and_then(Value::as_str)
            .ok_or(SnapshotError::MissingReferenceId)?
            .to_string();
        let pointer_type = expr.typ();
        let tag = match pointer_type.pointee() {
            Some(Type::Struct { tag, .. }) => tag.clone(),
            _ => return Err(SnapshotError::UnsupportedTarget(pointer_type.to_string())),
        };
        // Struct-vs-array classification is fixed the first time an id is
        // encountered and never revisited.
        let is_array = self.catalog.is_array(&tag);

        let slot = match self.references.get(&id) {
            Some(slot) => slot.clone(),
            None => {
                let slot = if is_array {
                    let catalog = self.catalog;
                    let element = catalog
                        .shape(&tag)
                        .element_type
                        .clone()
                        .expect("array shape has an element type");
                    let array = self.allocator.fresh(
                        self.symbols,
                        "det_array_ref",
                        pointer_type.clone(),
                        false,
                    );
                    let length = self.allocator.fresh(
                        self.symbols,
                        "det_array_length",
                        Type::int(),
                        false,
                    );
                    block.assign(length.expr(), Expr::Nondet { typ: Type::int() });
                    block.assume(Expr::binary(
                        BinOp::Ge,
                        length.expr(),
                        Expr::int_const(0, Type::int()),
                    ));
                    block.add(Instr::AllocateArray {
                        target: array.expr(),
                        element,
                        length: length.expr(),
                    });
                    ReferenceSlot {
                        expr: array.expr(),
                        array_length: Some(length.expr()),
                    }
                } else {
                    let site = self.allocator.allocate_dynamic_object(
                        block,
                        self.symbols,
                        self.catalog,
                        expr,
                        &Type::struct_tag(&tag),
                    );
                    ReferenceSlot {
                        expr: site,
                        array_length: None,
                    }
                };
                self.references.insert(id.clone(), slot.clone());
                slot
            }
        };

        // Only the canonical occurrence carries field data.
        if has_key(json, ID_KEY) {
            if is_array {
                self.assign_array(
                    block,
                    &slot.expr,
                    json,
                    slot.array_length.clone(),
                    type_from_array,
                )?;
            } else {
                self.assign_struct(block, &Expr::deref(slot.expr.clone()), json)?;
            }
        }
        block.assign(expr.clone(), slot.expr.clone().cast_to(expr.typ()));
        Ok(())
    }

    /// Array node: length law, backing storage, per-element recursion with
    /// an element-type hint for generic element materialization.
    fn assign_array(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
        given_length: Option<Expr>,
        type_from_array: Option<&str>,
    ) -> Result<(), SnapshotError> {
        let pointer_type = expr.typ();
        let tag = match pointer_type.pointee() {
            Some(Type::Struct { tag, .. }) => tag.clone(),
            _ => return Err(SnapshotError::UnsupportedTarget(pointer_type.to_string())),
        };
        let catalog = self.catalog;
        let shape = catalog.shape(&tag);
        debug_assert!(shape.is_array());

        let items = untyped_items(json, &tag)?;
        let element_hint = element_type_hint(json, type_from_array);
        let declared_element = shape
            .element_type
            .clone()
            .expect("array shape has an element type");
        let element = self.resolve_element_type(element_hint.as_deref(), &declared_element);

        let length = match given_length {
            Some(length) => length,
            None => {
                let length = self.allocator.fresh(
                    self.symbols,
                    "det_array_length",
                    Type::int(),
                    false,
                );
                block.assign(length.expr(), Expr::Nondet { typ: Type::int() });
                block.assume(Expr::binary(
                    BinOp::Ge,
                    length.expr(),
                    Expr::int_const(0, Type::int()),
                ));
                block.add(Instr::AllocateArray {
                    target: expr.clone(),
                    element: declared_element.clone(),
                    length: length.expr(),
                });
                length.expr()
            }
        };

        let count = Expr::int_const(items.len() as i128, Type::int());
        if has_nondet_length(json) {
            // The element list is a lower bound; the configured maximum caps
            // the nondeterministic remainder.
            block.assume(Expr::binary(BinOp::Ge, length.clone(), count));
            block.assume(Expr::binary(
                BinOp::Le,
                length,
                Expr::int_const(self.options.max_nondet_array_length as i128, Type::int()),
            ));
        } else {
            block.assume(Expr::binary(BinOp::Eq, length, count));
        }

        let data_field = shape.field(ARRAY_DATA_FIELD).expect("array data field");
        let element_pointer = Type::pointer_to(element.clone());
        let data = Expr::member(
            Expr::deref(expr.clone()),
            ARRAY_DATA_FIELD,
            data_field.typ.clone(),
        )
        .cast_to(element_pointer.clone());
        let data_init = self.allocator.fresh(
            self.symbols,
            "det_array_data_init",
            element_pointer,
            false,
        );
        block.assign(data_init.expr(), data);

        for (index, item) in items.iter().enumerate() {
            let cell = Expr::index(data_init.expr(), Expr::int_const(index as i128, Type::int()));
            self.assign_rec(block, &cell, item, element_hint.as_deref())?;
        }
        Ok(())
    }

    fn resolve_element_type(&self, hint: Option<&str>, declared: &Type) -> Type {
        let hint = match hint {
            Some(h) => h,
            None => return declared.clone(),
        };
        match hint.parse::<Type>() {
            Ok(Type::Struct { tag, .. }) if self.catalog.lookup(&tag).is_none() => {
                warn!("unknown element type `{}`, keeping `{}`", hint, declared);
                declared.clone()
            }
            Ok(Type::Pointer(inner)) => {
                if let Type::Struct { ref tag, .. } = *inner {
                    if self.catalog.lookup(tag).is_none() {
                        warn!("unknown element type `{}`, keeping `{}`", hint, declared);
                        return declared.clone();
                    }
                }
                Type::Pointer(inner)
            }
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("unparseable element type `{}`, keeping `{}`", hint, declared);
                declared.clone()
            }
        }
    }

    /// Enum leaf: ensure the constants table is populated through the
    /// idempotent static-initializer wrapper, then index it by the explicit
    /// ordinal. Enums are not tracked through the reference map.
    fn assign_enum(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
        tag: &str,
    ) -> Result<(), SnapshotError> {
        block.add(Instr::Call {
            function: Catalog::static_init_wrapper(tag),
            args: Vec::new(),
        });
        let ordinal_text = json
            .get(ORDINAL_KEY)
            .and_then(scalar_text)
            .ok_or_else(|| SnapshotError::MissingOrdinal(tag.to_string()))?;
        let ordinal: i128 =
            ordinal_text
                .trim()
                .parse()
                .map_err(|_| SnapshotError::InvalidPrimitive {
                    kind: "an enum ordinal",
                    text: ordinal_text.clone(),
                })?;

        let enum_pointer = Type::pointer_to(Type::struct_tag(tag));
        let table_tag = Catalog::array_tag(&enum_pointer);
        let data_type = self
            .catalog
            .lookup(&table_tag)
            .and_then(|s| s.field(ARRAY_DATA_FIELD))
            .map(|f| f.typ.clone())
            .unwrap_or_else(|| Type::pointer_to(Type::Void));
        let table = Expr::symbol(
            &Catalog::constants_table_name(tag),
            Type::pointer_to(Type::struct_tag(&table_tag)),
        );
        let data = Expr::member(Expr::deref(table), ARRAY_DATA_FIELD, data_type);
        let constant = Expr::index(data, Expr::int_const(ordinal, Type::int()));
        block.assign(expr.clone(), constant.cast_to(expr.typ()));
        Ok(())
    }

    /// Struct lvalue: string-like types assign a deduplicated literal;
    /// everything else gets a zero write with class identity followed by
    /// the fields.
    fn assign_struct(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
    ) -> Result<(), SnapshotError> {
        let struct_type = expr.typ();
        let tag = match &struct_type {
            Type::Struct { tag, .. } => tag.clone(),
            other => panic!("struct assignment to non-struct type `{}`", other),
        };
        if self.catalog.is_string_like(&tag) {
            // Strings are always bare text nodes, never value-wrapped.
            let text = json
                .as_str()
                .ok_or_else(|| SnapshotError::NotAString(tag.clone()))?;
            let literal = self.symbols.string_literal(text, struct_type.clone());
            block.assign(expr.clone(), literal);
            return Ok(());
        }
        block.assign(
            expr.clone(),
            Expr::ZeroObject {
                typ: struct_type,
                class_identifier: tag,
            },
        );
        self.assign_struct_fields(block, expr, json)
    }

    /// Assigns every field of `expr` from the node's sub-trees. Base-class
    /// components recurse with the parent's declared shape against the same
    /// node; internal bookkeeping fields are skipped.
    fn assign_struct_fields(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
    ) -> Result<(), SnapshotError> {
        let struct_type = expr.typ();
        let tag = match &struct_type {
            Type::Struct { tag, .. } => tag.clone(),
            other => panic!("field assignment to non-struct type `{}`", other),
        };
        let object = json
            .as_object()
            .ok_or_else(|| SnapshotError::ExpectedObject(tag.clone()))?;
        let catalog = self.catalog;
        let shape: &ClassShape = catalog.shape(&tag);
        for field in &shape.fields {
            if field.name == CLASS_IDENTIFIER_FIELD || field.name == LOCK_FIELD {
                continue;
            }
            let member = Expr::member(expr.clone(), &field.name, field.typ.clone());
            if field.name.starts_with('@') {
                self.assign_struct_fields(block, &member, json)?;
            } else {
                let member_json = object.get(&field.name).unwrap_or(&Value::Null);
                self.assign_rec(block, &member, member_json, None)?;
            }
        }
        Ok(())
    }

    /// Primitive leaf, parsed according to the expected kind. A null marker
    /// leaves the target at its prior default value.
    fn assign_primitive(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        json: &Value,
    ) -> Result<(), SnapshotError> {
        if json.is_null() {
            return Ok(());
        }
        let typ = expr.typ();
        let kind = match typ {
            Type::Primitive(kind) => kind,
            other => return Err(SnapshotError::UnsupportedTarget(other.to_string())),
        };
        let value = match kind {
            PrimitiveType::Bool => match json.as_bool() {
                Some(b) => Expr::BoolConst(b),
                None => {
                    return Err(SnapshotError::InvalidPrimitive {
                        kind: "a boolean",
                        text: json.to_string(),
                    })
                }
            },
            PrimitiveType::Byte | PrimitiveType::Short | PrimitiveType::Int
            | PrimitiveType::Long => {
                let text = scalar_text(json).ok_or_else(|| SnapshotError::InvalidPrimitive {
                    kind: "an integer",
                    text: json.to_string(),
                })?;
                let parsed: i128 =
                    text.trim()
                        .parse()
                        .map_err(|_| SnapshotError::InvalidPrimitive {
                            kind: "an integer",
                            text: text.clone(),
                        })?;
                Expr::int_const(parsed, Type::Primitive(kind))
            }
            PrimitiveType::Float | PrimitiveType::Double => {
                let text = scalar_text(json).ok_or_else(|| SnapshotError::InvalidPrimitive {
                    kind: "a floating-point number",
                    text: json.to_string(),
                })?;
                let parsed: f64 =
                    text.trim()
                        .parse()
                        .map_err(|_| SnapshotError::InvalidPrimitive {
                            kind: "a floating-point number",
                            text: text.clone(),
                        })?;
                let value = if kind == PrimitiveType::Float {
                    parsed as f32 as f64
                } else {
                    parsed
                };
                Expr::FloatConst {
                    value,
                    typ: Type::Primitive(kind),
                }
            }
            PrimitiveType::Char => {
                let text = scalar_text(json).ok_or_else(|| SnapshotError::InvalidPrimitive {
                    kind: "a character",
                    text: json.to_string(),
                })?;
                Expr::int_const(parse_char(&text)?, Type::Primitive(kind))
            }
        };
        block.assign(expr.clone(), value);
        Ok(())
    }
}

/// The element list of an array node. Identity- and type-carrying array
/// nodes wrap their elements under `@items`; a plain node is the list
/// itself.
fn untyped_items<'v>(json: &'v Value, tag: &str) -> Result<&'v Vec<Value>, SnapshotError> {
    let unwrapped = if has_key(json, ITEMS_KEY) {
        json.get(ITEMS_KEY).expect("checked key")
    } else {
        json
    };
    unwrapped
        .as_array()
        .ok_or_else(|| SnapshotError::MissingItems(tag.to_string()))
}

/// Element-type hint for the cells of an array node: an explicit `@type`
/// (an `array[...]` name) takes priority over a hint inherited from an
/// enclosing array.
fn element_type_hint(json: &Value, type_from_array: Option<&str>) -> Option<String> {
    let name = if let Some(name) = json.get(TYPE_KEY).and_then(Value::as_str) {
        name.to_string()
    } else {
        let hint = type_from_array?;
        // A hint names the enclosing element type, e.g. `*array[int]`.
        match hint.strip_prefix('*') {
            Some(inner) => inner.to_string(),
            None => hint.to_string(),
        }
    };
    let inner = name.strip_prefix("array[")?.strip_suffix(']')?;
    Some(inner.to_string())
}

/// A character payload is its text form; the documented fallback accepts a
/// bare 4-hex-digit escape an upstream encoder fails to decode.
fn parse_char(text: &str) -> Result<i128, SnapshotError> {
    static HEX4: OnceLock<Regex> = OnceLock::new();
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c as i128),
        _ => {
            let hex4 = HEX4.get_or_init(|| Regex::new("^[0-9a-fA-F]{4}$").expect("valid pattern"));
            if hex4.is_match(text) {
                let value = u32::from_str_radix(text, 16).expect("matched hex digits");
                Ok(value as i128)
            } else {
                Err(SnapshotError::InvalidPrimitive {
                    kind: "a character",
                    text: text.to_string(),
                })
            }
        }
    }
}
