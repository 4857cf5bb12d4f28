use super::allocate::{AllocationKind, Allocator};
use super::catalog::{
    Catalog, ARRAY_DATA_FIELD, ARRAY_LENGTH_FIELD, CLASS_IDENTIFIER_FIELD, LOCK_FIELD,
};
use super::generics::GenericBindings;
use super::policy::PointerTypePolicy;
use super::symbol::SymbolTable;
use super::{BinOp, Expr, Instr, InstrBlock, ObjectFactoryOptions, PrimitiveType, Type, TypeTag};
use log::{debug, warn};
use std::collections::HashSet;

//
// Public Interface
//

/// Intrinsic connecting a character buffer to the pointer it is reached by.
pub const ASSOCIATE_ARRAY_TO_POINTER: &str = "associate_array_to_pointer";
/// Intrinsic connecting a character buffer to its length symbol.
pub const ASSOCIATE_LENGTH_TO_ARRAY: &str = "associate_length_to_array";
/// Intrinsic constraining buffer contents to a character range.
pub const CONSTRAIN_CHARACTERS: &str = "constrain_characters";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Allocate fresh storage.
    NoUpdate,
    /// Emit a runtime nondeterministic branch between updating in place and
    /// allocating fresh.
    MayUpdate,
    /// Mutate the fields of an existing instance, never reallocate.
    MustUpdate,
}

/// Creates a fresh root symbol of type `typ` and emits instructions that
/// build an arbitrary, bounded object tree into it. Returns the root
/// expression; `out` receives declarations followed by the body.
#[allow(clippy::too_many_arguments)]
pub fn gen_nondet_object<P: PointerTypePolicy>(
    typ: &Type,
    base_name: &str,
    out: &mut InstrBlock,
    allow_null: bool,
    kind: AllocationKind,
    symbols: &mut SymbolTable,
    catalog: &Catalog,
    policy: &P,
    options: &ObjectFactoryOptions,
) -> Expr {
    let root = symbols.fresh(&options.function_id, base_name, typ.clone(), false);
    let mut factory = NondetFactory::new(symbols, catalog, policy, options);
    let mut body = InstrBlock::new();
    time_debug!("nondeterministic materialization", {
        factory.gen_init(
            &mut body,
            &root.expr(),
            false,
            None,
            false,
            kind,
            None,
            allow_null,
            0,
            UpdateMode::NoUpdate,
        )
    });
    out.add(Instr::Decl {
        symbol: root.expr(),
    });
    factory.allocator.declare_created(out);
    out.append(body);
    root.expr()
}

/// Emits instructions that (re)initialize the caller-provided lvalue
/// `expr`. `MustUpdate` is illegal as the mode of the outermost call.
#[allow(clippy::too_many_arguments)]
pub fn gen_nondet_init<P: PointerTypePolicy>(
    expr: &Expr,
    out: &mut InstrBlock,
    skip_classid: bool,
    kind: AllocationKind,
    allow_null: bool,
    update: UpdateMode,
    symbols: &mut SymbolTable,
    catalog: &Catalog,
    policy: &P,
    options: &ObjectFactoryOptions,
) {
    assert!(
        update != UpdateMode::MustUpdate,
        "in-place update must not be requested for the outermost call"
    );
    let mut factory = NondetFactory::new(symbols, catalog, policy, options);
    let mut body = InstrBlock::new();
    time_debug!("nondeterministic materialization", {
        factory.gen_init(
            &mut body, expr, false, None, skip_classid, kind, None, allow_null, 0, update,
        )
    });
    factory.allocator.declare_created(out);
    out.append(body);
}

//
// Private Implementation
//

/// Printable ASCII characters are between ' ' and '~'.
const PRINTABLE_RANGE: &str = " -~";

/// Set of struct tags currently open along the recursive descent. A tag may
/// be entered any number of times while the depth bound holds; the repeat
/// entry beyond the bound truncates the tree instead of expanding further.
#[derive(Debug, Default)]
struct RecursionSet {
    open: HashSet<TypeTag>,
}

impl RecursionSet {
    /// Returns true iff `tag` was newly added, in which case the caller
    /// owns the entry and must `leave` it when its scope ends.
    fn enter(&mut self, tag: &str) -> bool {
        self.open.insert(tag.to_string())
    }

    fn leave(&mut self, tag: &str) {
        let removed = self.open.remove(tag);
        debug_assert!(removed, "left recursion-set entry `{}` twice", tag);
    }
}

struct NondetFactory<'a, P: PointerTypePolicy> {
    symbols: &'a mut SymbolTable,
    catalog: &'a Catalog,
    policy: &'a P,
    options: &'a ObjectFactoryOptions,
    allocator: Allocator,
    recursion_set: RecursionSet,
    generics: GenericBindings,
}

impl<'a, P: PointerTypePolicy> NondetFactory<'a, P> {
    fn new(
        symbols: &'a mut SymbolTable,
        catalog: &'a Catalog,
        policy: &'a P,
        options: &'a ObjectFactoryOptions,
    ) -> Self {
        Self {
            symbols,
            catalog,
            policy,
            options,
            allocator: Allocator::new(&options.function_id),
            recursion_set: RecursionSet::default(),
            generics: GenericBindings::new(),
        }
    }

    /// Generic parameter pairs to bind when entering `typ` (looking through
    /// one level of pointer).
    fn generic_pairs_for(&self, typ: &Type) -> (Vec<String>, Vec<Type>) {
        let target = match typ {
            Type::Pointer(pointee) => pointee.as_ref(),
            other => other,
        };
        if let Type::Struct { tag, type_args } = target {
            if !type_args.is_empty() {
                if let Some(shape) = self.catalog.lookup(tag) {
                    return (shape.type_params.clone(), type_args.clone());
                }
            }
        }
        (Vec::new(), Vec::new())
    }

    /// Dispatches on the (generically substituted) type of `expr`.
    #[allow(clippy::too_many_arguments)]
    fn gen_init(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        is_sub: bool,
        class_identifier: Option<&str>,
        skip_classid: bool,
        kind: AllocationKind,
        override_type: Option<&Type>,
        allow_null: bool,
        depth: usize,
        update: UpdateMode,
    ) {
        if let (Type::Primitive(declared), Some(Type::Primitive(requested))) =
            (&expr.typ(), override_type)
        {
            // An override may refine a pointer or an untyped cell, never
            // change a primitive's kind.
            assert!(
                declared == requested,
                "override type `{}` conflicts with declared `{}`",
                requested.keyword(),
                declared.keyword()
            );
        }
        let declared = override_type.cloned().unwrap_or_else(|| expr.typ());
        let typ = self.generics.concretize(&declared);
        match &typ {
            Type::Pointer(_) => {
                let (params, args) = self.generic_pairs_for(&typ);
                let scope = self.generics.push_pairs(&params, &args);
                self.gen_pointer_init(block, expr, kind, &typ, allow_null, depth, update);
                self.generics.pop_scope(scope);
            }
            Type::Struct { .. } => {
                let scope = if is_sub {
                    let (params, args) = self.generic_pairs_for(&typ);
                    Some(self.generics.push_pairs(&params, &args))
                } else {
                    None
                };
                self.gen_struct_init(
                    block,
                    expr,
                    is_sub,
                    class_identifier,
                    skip_classid,
                    kind,
                    &typ,
                    depth,
                    update,
                );
                if let Some(scope) = scope {
                    self.generics.pop_scope(scope);
                }
            }
            Type::Primitive(p) => {
                let rhs = if *p == PrimitiveType::Bool {
                    Expr::NondetBool
                } else {
                    Expr::Nondet { typ: typ.clone() }
                };
                block.assign(expr.clone(), rhs);
            }
            // A type parameter with no binding in scope: references are
            // erased here, so null is the only always-well-typed value.
            Type::Param(_) => block.assign(expr.clone(), Expr::null(typ.clone())),
            Type::Void => {}
        }
    }

    /// Initializes a pointer-typed lvalue: possibly substitute a more
    /// concrete pointee, guard against unbounded recursion, then combine
    /// null / non-null / update-in-place candidate blocks.
    #[allow(clippy::too_many_arguments)]
    fn gen_pointer_init(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        kind: AllocationKind,
        pointer_type: &Type,
        allow_null: bool,
        depth: usize,
        update: UpdateMode,
    ) {
        let replacement = self
            .policy
            .resolve_pointer(pointer_type, &self.generics, self.catalog);
        if replacement != *pointer_type {
            debug!(
                "substituting pointer type `{}` for `{}`",
                replacement, pointer_type
            );
            let (params, args) = self.generic_pairs_for(&replacement);
            let scope = self.generics.push_pairs(&params, &args);
            let substitute = self.gen_subtype_pointer_init(block, kind, &replacement, depth);
            self.generics.pop_scope(scope);
            block.assign(expr.clone(), substitute.cast_to(pointer_type.clone()));
            return;
        }

        let pointee = pointer_type
            .pointee()
            .expect("pointer-typed expression expected")
            .clone();

        // Recursion guard: the first repeat visit of a struct tag at or
        // beyond the depth bound truncates instead of expanding further.
        let mut owned_entry: Option<TypeTag> = None;
        if let Type::Struct { tag, .. } = &pointee {
            if self.recursion_set.enter(tag) {
                owned_entry = Some(tag.clone());
            } else if depth >= self.options.max_nondet_tree_depth {
                debug!("truncating recursive type `{}` at depth {}", tag, depth);
                if update == UpdateMode::NoUpdate {
                    block.assign(expr.clone(), Expr::null(pointer_type.clone()));
                }
                return;
            }
        }

        let mut update_block = InstrBlock::new();
        if update != UpdateMode::NoUpdate {
            self.gen_pointer_target_init(
                &mut update_block,
                expr,
                &pointee,
                kind,
                depth,
                UpdateMode::MustUpdate,
            );
        }

        if update == UpdateMode::MustUpdate {
            block.append(update_block);
        } else {
            let mut non_null = InstrBlock::new();
            let mut string_done = false;
            if let Type::Struct { tag, .. } = &pointee {
                if self.catalog.is_string_like(tag) {
                    string_done = self.gen_string_init(&mut non_null, expr, tag);
                }
            }
            if !string_done {
                self.gen_pointer_target_init(
                    &mut non_null,
                    expr,
                    &pointee,
                    kind,
                    depth,
                    UpdateMode::NoUpdate,
                );
            }

            let null_assign = Instr::Assign {
                target: expr.clone(),
                value: Expr::null(pointer_type.clone()),
            };
            let mut fresh_block = InstrBlock::new();
            if pointee == Type::Void {
                // A void-like pointee leaves null as the only option.
                fresh_block.add(null_assign);
            } else if !allow_null {
                fresh_block.append(non_null);
            } else {
                fresh_block.add(Instr::IfThenElse {
                    cond: Expr::NondetBool,
                    then_block: InstrBlock::from(vec![null_assign]),
                    else_block: non_null,
                });
            }

            if update == UpdateMode::NoUpdate {
                block.append(fresh_block);
            } else {
                block.add(Instr::IfThenElse {
                    cond: Expr::NondetBool,
                    then_block: update_block,
                    else_block: fresh_block,
                });
            }
        }

        if let Some(tag) = owned_entry {
            self.recursion_set.leave(&tag);
        }
    }

    /// Initializes the object a pointer refers to, allocating fresh storage
    /// under `NoUpdate` and reusing the existing object under `MustUpdate`.
    fn gen_pointer_target_init(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        target_type: &Type,
        kind: AllocationKind,
        depth: usize,
        update: UpdateMode,
    ) {
        debug_assert!(update != UpdateMode::MayUpdate);
        if let Type::Struct { tag, .. } = target_type {
            if self.catalog.is_array(tag) {
                self.gen_array_init(block, expr, depth + 1, update);
                return;
            }
        }
        let target = if update == UpdateMode::NoUpdate {
            self.allocator.allocate_object(
                block,
                self.symbols,
                self.catalog,
                expr,
                target_type,
                kind,
            )
        } else {
            expr.clone()
        };
        let init_expr = match &target {
            Expr::AddressOf { base } => (**base).clone(),
            _ => Expr::deref(target.clone()),
        };
        self.gen_init(
            block,
            &init_expr,
            false,
            None,
            false,
            kind,
            None,
            true,
            depth + 1,
            update,
        );
    }

    /// Materializes a fresh pointer of the substituted type and returns its
    /// symbol; the caller assigns it back with a cast.
    fn gen_subtype_pointer_init(
        &mut self,
        block: &mut InstrBlock,
        kind: AllocationKind,
        replacement_pointer: &Type,
        depth: usize,
    ) -> Expr {
        let symbol = self
            .allocator
            .fresh(self.symbols, "tmp_object", replacement_pointer.clone(), false);
        self.gen_init(
            block,
            &symbol.expr(),
            false,
            None,
            false,
            kind,
            None,
            true,
            depth,
            UpdateMode::NoUpdate,
        );
        symbol.expr()
    }

    /// Fields of a struct, preceded by a single whole-object zero write
    /// carrying the class identity unless the caller already wrote one.
    #[allow(clippy::too_many_arguments)]
    fn gen_struct_init(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        is_sub: bool,
        class_identifier: Option<&str>,
        skip_classid: bool,
        kind: AllocationKind,
        struct_type: &Type,
        depth: usize,
        update: UpdateMode,
    ) {
        let tag = match struct_type {
            Type::Struct { tag, .. } => tag,
            other => panic!("struct initialization of non-struct type `{}`", other),
        };
        let catalog = self.catalog;
        let shape = catalog.shape(tag);

        let mut class_id = class_identifier.map(str::to_string);
        if !is_sub && !skip_classid && update != UpdateMode::MustUpdate {
            class_id = Some(tag.clone());
            block.assign(
                expr.clone(),
                Expr::ZeroObject {
                    typ: struct_type.clone(),
                    class_identifier: tag.clone(),
                },
            );
        }

        for field in &shape.fields {
            if field.name == CLASS_IDENTIFIER_FIELD || field.name == LOCK_FIELD {
                continue;
            }
            let field_is_sub = field.name.starts_with('@');
            let member = Expr::member(expr.clone(), &field.name, field.typ.clone());
            // MustUpdate binds only this object; pointers to other objects
            // get the chance to be left alone.
            let child_update = if update == UpdateMode::MustUpdate && !field_is_sub {
                UpdateMode::MayUpdate
            } else {
                update
            };
            self.gen_init(
                block,
                &member,
                field_is_sub,
                class_id.as_deref(),
                false,
                kind,
                None,
                true,
                depth,
                child_update,
            );
        }

        if let Some(method) = &shape.post_init_method {
            block.add(Instr::Call {
                function: method.clone(),
                args: vec![Expr::address_of(expr.clone())],
            });
        }
    }

    /// Bounded nondet-length string buffer behind a string-like object.
    /// Returns false when the layout lacks the expected fields, in which
    /// case the caller falls back to the generic struct path.
    fn gen_string_init(&mut self, block: &mut InstrBlock, expr: &Expr, tag: &str) -> bool {
        let catalog = self.catalog;
        let shape = catalog.shape(tag);
        let (length_field, data_field) =
            match (shape.field(ARRAY_LENGTH_FIELD), shape.field(ARRAY_DATA_FIELD)) {
                (Some(l), Some(d)) => (l, d),
                _ => {
                    warn!(
                        "string-like `{}` lacks length/data fields, using the generic path",
                        tag
                    );
                    return false;
                }
            };

        let site = self.allocator.allocate_dynamic_object(
            block,
            self.symbols,
            self.catalog,
            expr,
            &Type::struct_tag(tag),
        );
        let object = Expr::deref(site);
        block.assign(
            object.clone(),
            Expr::ZeroObject {
                typ: object.typ(),
                class_identifier: tag.to_string(),
            },
        );

        let length = self
            .allocator
            .fresh(self.symbols, "nondet_string_length", Type::int(), false);
        block.assign(length.expr(), Expr::Nondet { typ: Type::int() });
        block.assume(Expr::binary(
            BinOp::Ge,
            length.expr(),
            Expr::int_const(0, Type::int()),
        ));
        block.assume(Expr::binary(
            BinOp::Le,
            length.expr(),
            Expr::int_const(self.options.max_nondet_string_length as i128, Type::int()),
        ));

        let char_type = Type::Primitive(PrimitiveType::Char);
        let data = self.allocator.fresh(
            self.symbols,
            "string_data",
            Type::pointer_to(char_type.clone()),
            false,
        );
        block.add(Instr::AllocateArray {
            target: data.expr(),
            element: char_type,
            length: length.expr(),
        });

        block.assign(
            Expr::member(object.clone(), ARRAY_LENGTH_FIELD, length_field.typ.clone()),
            length.expr(),
        );
        block.assign(
            Expr::member(object, ARRAY_DATA_FIELD, data_field.typ.clone()),
            data.expr(),
        );
        block.add(Instr::Call {
            function: ASSOCIATE_ARRAY_TO_POINTER.to_string(),
            args: vec![data.expr()],
        });
        block.add(Instr::Call {
            function: ASSOCIATE_LENGTH_TO_ARRAY.to_string(),
            args: vec![data.expr(), length.expr()],
        });
        if self.options.string_printable {
            block.add(Instr::Call {
                function: CONSTRAIN_CHARACTERS.to_string(),
                args: vec![
                    data.expr(),
                    length.expr(),
                    Expr::StrConst(PRINTABLE_RANGE.to_string()),
                ],
            });
        }
        true
    }

    /// Nondet-length array: choose and bound a length, allocate backing
    /// storage, then a counted loop initializing each cell.
    fn gen_array_init(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        depth: usize,
        update: UpdateMode,
    ) {
        debug_assert!(update != UpdateMode::MayUpdate);
        let pointer_type = expr.typ();
        let tag = match pointer_type.pointee() {
            Some(Type::Struct { tag, .. }) => tag.clone(),
            _ => panic!("array initialization expects a pointer to an array struct"),
        };
        let catalog = self.catalog;
        let shape = catalog.shape(&tag);
        let element = self.generics.concretize(
            shape
                .element_type
                .as_ref()
                .expect("array shape has an element type"),
        );

        let max_length = Expr::int_const(self.options.max_nondet_array_length as i128, Type::int());
        if update == UpdateMode::NoUpdate {
            self.allocate_nondet_length_array(block, expr, &max_length, &element);
        }
        // Under MustUpdate the existing length and backing store are reused.

        let deref = Expr::deref(expr.clone());
        let length_field = shape.field(ARRAY_LENGTH_FIELD).expect("array length field");
        let data_field = shape.field(ARRAY_DATA_FIELD).expect("array data field");
        let length = Expr::member(deref.clone(), ARRAY_LENGTH_FIELD, length_field.typ.clone());
        let element_pointer = Type::pointer_to(element.clone());
        let data = Expr::member(deref, ARRAY_DATA_FIELD, data_field.typ.clone())
            .cast_to(element_pointer.clone());

        // Interpose a fresh symbol so cells are not indexed through a cast.
        let data_init = self
            .allocator
            .fresh(self.symbols, "array_data_init", element_pointer, false);
        block.assign(data_init.expr(), data);

        let counter = self
            .allocator
            .fresh(self.symbols, "array_init_iter", Type::int(), false);
        block.assign(counter.expr(), Expr::int_const(0, Type::int()));

        let head_label = format!("{}_header", counter.name);
        let done_label = format!("{}_done", counter.name);
        block.add(Instr::Label {
            name: head_label.clone(),
        });
        block.add(Instr::IfThenElse {
            cond: Expr::binary(BinOp::Eq, counter.expr(), length),
            then_block: InstrBlock::from(vec![Instr::Goto {
                target: done_label.clone(),
            }]),
            else_block: InstrBlock::new(),
        });
        if update != UpdateMode::MustUpdate {
            // Redundant bound against the configured maximum, easier for the
            // downstream unwinder to recognize.
            block.add(Instr::IfThenElse {
                cond: Expr::binary(BinOp::Eq, counter.expr(), max_length),
                then_block: InstrBlock::from(vec![Instr::Goto {
                    target: done_label.clone(),
                }]),
                else_block: InstrBlock::new(),
            });
        }

        let cell = Expr::index(data_init.expr(), counter.expr());
        let child_update = if update == UpdateMode::MustUpdate {
            UpdateMode::MayUpdate
        } else {
            update
        };
        // Cells are variable in number, so their storage is always dynamic.
        self.gen_init(
            block,
            &cell,
            false,
            None,
            false,
            AllocationKind::Dynamic,
            Some(&element),
            true,
            depth,
            child_update,
        );

        block.assign(
            counter.expr(),
            Expr::binary(BinOp::Add, counter.expr(), Expr::int_const(1, Type::int())),
        );
        block.add(Instr::Goto { target: head_label });
        block.add(Instr::Label { name: done_label });
    }

    fn allocate_nondet_length_array(
        &mut self,
        block: &mut InstrBlock,
        expr: &Expr,
        max_length: &Expr,
        element: &Type,
    ) {
        let length = self
            .allocator
            .fresh(self.symbols, "nondet_array_length", Type::int(), false);
        self.gen_init(
            block,
            &length.expr(),
            false,
            None,
            false,
            AllocationKind::Local,
            None,
            false,
            0,
            UpdateMode::NoUpdate,
        );
        block.assume(Expr::binary(
            BinOp::Ge,
            length.expr(),
            Expr::int_const(0, Type::int()),
        ));
        block.assume(Expr::binary(BinOp::Le, length.expr(), max_length.clone()));
        block.add(Instr::AllocateArray {
            target: expr.clone(),
            element: element.clone(),
            length: length.expr(),
        });
    }
}
