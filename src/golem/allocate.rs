use super::catalog::Catalog;
use super::symbol::{Symbol, SymbolTable};
use super::{Expr, Instr, InstrBlock, PrimitiveType, Type};
use log::trace;
use strum::{EnumString, EnumVariantNames, IntoStaticStr};

//
// Public Interface
//

/// Lifetime of storage created for a new object: a static-lifetime symbol,
/// a stack-like local, or a heap allocation reached through a pointer.
/// Chosen by the caller and inherited down one recursive call; arrays
/// override to `Dynamic` for their backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum AllocationKind {
    Global,
    Local,
    Dynamic,
}

/// Creates freshly named storage and queues every created symbol so the
/// caller can emit declarations ahead of the body that uses them.
#[derive(Debug)]
pub struct Allocator {
    function_id: String,
    created: Vec<Symbol>,
}

//
// Private Implementation
//

impl Allocator {
    pub fn new(function_id: &str) -> Self {
        Self {
            function_id: function_id.to_string(),
            created: Vec::new(),
        }
    }

    /// Introduces a fresh symbol and queues it for later declaration.
    pub fn fresh(
        &mut self,
        symbols: &mut SymbolTable,
        base_name: &str,
        typ: Type,
        static_lifetime: bool,
    ) -> Symbol {
        let symbol = symbols.fresh(&self.function_id, base_name, typ, static_lifetime);
        self.created.push(symbol.clone());
        symbol
    }

    /// Allocates storage of type `allocate_type` for the pointer-typed
    /// lvalue `target` and emits `target := <address>` (cast if the static
    /// and requested types differ). Returns the address expression, which
    /// for dynamic allocations is the fresh allocation-site symbol so the
    /// result stays addressable without a double indirection.
    pub fn allocate_object(
        &mut self,
        block: &mut InstrBlock,
        symbols: &mut SymbolTable,
        catalog: &Catalog,
        target: &Expr,
        allocate_type: &Type,
        kind: AllocationKind,
    ) -> Expr {
        let target_type = target.typ();
        let pointee = target_type
            .pointee()
            .unwrap_or_else(|| panic!("allocation target `{}` must be pointer-typed", target));
        let cast_needed = allocate_type != pointee;
        match kind {
            AllocationKind::Local | AllocationKind::Global => {
                let symbol = self.fresh(
                    symbols,
                    "tmp_object",
                    allocate_type.clone(),
                    kind == AllocationKind::Global,
                );
                trace!("allocating {:?} storage `{}`", kind, symbol.name);
                let mut address = Expr::address_of(symbol.expr());
                if cast_needed {
                    address = address.cast_to(target_type);
                }
                block.assign(target.clone(), address.clone());
                address
            }
            AllocationKind::Dynamic => {
                self.allocate_dynamic_object(block, symbols, catalog, target, allocate_type)
            }
        }
    }

    /// Heap allocation through an intermediate allocation-site symbol.
    pub fn allocate_dynamic_object(
        &mut self,
        block: &mut InstrBlock,
        symbols: &mut SymbolTable,
        catalog: &Catalog,
        target: &Expr,
        allocate_type: &Type,
    ) -> Expr {
        let target_type = target.typ();
        if *allocate_type == Type::Void {
            let null = Expr::null(target_type);
            block.assign(target.clone(), null.clone());
            return null;
        }
        let size = catalog
            .size_of(allocate_type)
            .unwrap_or_else(|| panic!("type `{}` has no defined size", allocate_type));
        let site = self.fresh(
            symbols,
            "alloc_site",
            Type::pointer_to(allocate_type.clone()),
            false,
        );
        trace!("allocating {} heap bytes at `{}`", size, site.name);
        block.add(Instr::Allocate {
            target: site.expr(),
            typ: allocate_type.clone(),
            size: Expr::int_const(size as i128, Type::Primitive(PrimitiveType::Long)),
        });
        block.assign(target.clone(), site.expr().cast_to(target_type));
        site.expr()
    }

    /// Emits a declaration for every queued non-static symbol. Static
    /// symbols live in the symbol table and need no local declaration.
    pub fn declare_created(&self, out: &mut InstrBlock) {
        for symbol in &self.created {
            if !symbol.static_lifetime {
                out.add(Instr::Decl {
                    symbol: symbol.expr(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn allocation_kind_parses_kebab_case() {
        assert_eq!(
            AllocationKind::from_str("dynamic").unwrap(),
            AllocationKind::Dynamic
        );
        assert!(AllocationKind::from_str("Dynamic").is_err());
    }

    #[test]
    fn local_allocation_assigns_an_address() {
        let mut allocator = Allocator::new("main");
        let mut symbols = SymbolTable::new();
        let catalog = Catalog::new();
        let mut block = InstrBlock::new();
        let target = Expr::symbol("p", Type::pointer_to(Type::struct_tag("Point")));
        let address = allocator.allocate_object(
            &mut block,
            &mut symbols,
            &catalog,
            &target,
            &Type::struct_tag("Point"),
            AllocationKind::Local,
        );
        assert!(matches!(address, Expr::AddressOf { .. }));
        assert_eq!(block.len(), 1);
        assert!(matches!(block.instrs()[0], Instr::Assign { .. }));

        let mut decls = InstrBlock::new();
        allocator.declare_created(&mut decls);
        assert_eq!(decls.len(), 1);
    }

    #[test]
    fn mismatched_static_type_is_cast() {
        let mut allocator = Allocator::new("main");
        let mut symbols = SymbolTable::new();
        let catalog = Catalog::new();
        let mut block = InstrBlock::new();
        // Static type *void, requested type Point.
        let target = Expr::symbol("p", Type::pointer_to(Type::Void));
        let address = allocator.allocate_object(
            &mut block,
            &mut symbols,
            &catalog,
            &target,
            &Type::struct_tag("Point"),
            AllocationKind::Local,
        );
        assert!(matches!(address, Expr::Cast { .. }));
    }

    #[test]
    fn dynamic_allocation_goes_through_an_allocation_site() {
        let mut allocator = Allocator::new("main");
        let mut symbols = SymbolTable::new();
        let mut catalog = Catalog::new();
        catalog.insert(crate::golem::catalog::ClassShape {
            tag: "Point".to_string(),
            fields: Vec::new(),
            ancestors: Vec::new(),
            type_params: Vec::new(),
            element_type: None,
            size: Some(8),
            post_init_method: None,
        });
        let mut block = InstrBlock::new();
        let target = Expr::symbol("p", Type::pointer_to(Type::struct_tag("Point")));
        let site = allocator.allocate_object(
            &mut block,
            &mut symbols,
            &catalog,
            &target,
            &Type::struct_tag("Point"),
            AllocationKind::Dynamic,
        );
        // allocate into the site, then assign the site to the target
        assert_eq!(block.len(), 2);
        assert!(matches!(block.instrs()[0], Instr::Allocate { .. }));
        match &block.instrs()[1] {
            Instr::Assign { value, .. } => assert_eq!(value, &site),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "has no defined size")]
    fn dynamic_allocation_requires_a_size() {
        let mut allocator = Allocator::new("main");
        let mut symbols = SymbolTable::new();
        let catalog = Catalog::new();
        let mut block = InstrBlock::new();
        let target = Expr::symbol("p", Type::pointer_to(Type::struct_tag("Unsized")));
        allocator.allocate_object(
            &mut block,
            &mut symbols,
            &catalog,
            &target,
            &Type::struct_tag("Unsized"),
            AllocationKind::Dynamic,
        );
    }
}
