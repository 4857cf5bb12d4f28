use super::catalog::Catalog;
use super::generics::GenericBindings;
use super::Type;

/// Resolves pointer types before materialization, for example replacing a
/// pointer to an abstract type with a pointer to a concrete implementation.
/// Returning the input unchanged keeps the declared type.
pub trait PointerTypePolicy {
    fn resolve_pointer(
        &self,
        pointer_type: &Type,
        bindings: &GenericBindings,
        catalog: &Catalog,
    ) -> Type;
}

/// Default policy: every pointer keeps its declared type.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityPolicy;

impl PointerTypePolicy for IdentityPolicy {
    fn resolve_pointer(
        &self,
        pointer_type: &Type,
        _bindings: &GenericBindings,
        _catalog: &Catalog,
    ) -> Type {
        pointer_type.clone()
    }
}
