use super::Type;

//
// Public Interface
//

/// Stack of generic parameter specializations in scope. Entering a generic
/// struct or pointer pushes its `parameter -> concrete type` pairs; leaving
/// pops them again. Inner pairs shadow outer ones.
#[derive(Debug, Default)]
pub struct GenericBindings {
    stack: Vec<(String, Type)>,
}

/// Token returned by `push_pairs`; handing it back to `pop_scope` removes
/// exactly the entries pushed since. Deliberately not `Copy` so a scope can
/// only be popped once.
#[derive(Debug)]
pub struct BindingScope {
    mark: usize,
}

//
// Private Implementation
//

impl GenericBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `params[i] -> args[i]` pairs. Arguments are concretized
    /// against the bindings currently in scope, so a parameter bound to an
    /// outer parameter resolves at push time. A raw use with fewer
    /// arguments than parameters binds only the given prefix.
    pub fn push_pairs(&mut self, params: &[String], args: &[Type]) -> BindingScope {
        let mark = self.stack.len();
        let concretized: Vec<(String, Type)> = params
            .iter()
            .zip(args.iter())
            .map(|(p, a)| (p.clone(), self.concretize(a)))
            .collect();
        self.stack.extend(concretized);
        BindingScope { mark }
    }

    pub fn pop_scope(&mut self, scope: BindingScope) {
        debug_assert!(scope.mark <= self.stack.len(), "scope popped out of order");
        self.stack.truncate(scope.mark);
    }

    pub fn resolve(&self, name: &str) -> Option<&Type> {
        self.stack
            .iter()
            .rev()
            .find(|(p, _)| p == name)
            .map(|(_, t)| t)
    }

    /// Replaces every bound parameter in `typ` by its specialization.
    /// Unbound parameters are left in place for the caller to decide.
    pub fn concretize(&self, typ: &Type) -> Type {
        match typ {
            Type::Param(name) => self.resolve(name).cloned().unwrap_or_else(|| typ.clone()),
            Type::Pointer(pointee) => Type::pointer_to(self.concretize(pointee)),
            Type::Struct { tag, type_args } => Type::Struct {
                tag: tag.clone(),
                type_args: type_args.iter().map(|a| self.concretize(a)).collect(),
            },
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn inner_bindings_shadow_outer_ones() {
        let mut bindings = GenericBindings::new();
        let outer = bindings.push_pairs(&params(&["T"]), &[Type::int()]);
        assert_eq!(bindings.resolve("T"), Some(&Type::int()));

        let inner = bindings.push_pairs(
            &params(&["T"]),
            &[Type::pointer_to(Type::struct_tag("Point"))],
        );
        assert_eq!(
            bindings.resolve("T"),
            Some(&Type::pointer_to(Type::struct_tag("Point")))
        );

        bindings.pop_scope(inner);
        assert_eq!(bindings.resolve("T"), Some(&Type::int()));
        bindings.pop_scope(outer);
        assert_eq!(bindings.resolve("T"), None);
    }

    #[test]
    fn concretize_substitutes_deeply() {
        let mut bindings = GenericBindings::new();
        let scope = bindings.push_pairs(&params(&["T"]), &[Type::struct_tag("Point")]);
        let typ = Type::pointer_to(Type::Struct {
            tag: "Box".to_string(),
            type_args: vec![Type::Param("T".to_string())],
        });
        assert_eq!(
            bindings.concretize(&typ),
            Type::pointer_to(Type::Struct {
                tag: "Box".to_string(),
                type_args: vec![Type::struct_tag("Point")],
            })
        );
        bindings.pop_scope(scope);
    }

    #[test]
    fn arguments_concretize_at_push_time() {
        let mut bindings = GenericBindings::new();
        let outer = bindings.push_pairs(&params(&["T"]), &[Type::int()]);
        // Box<T> entered with its argument naming the outer parameter.
        let inner = bindings.push_pairs(&params(&["E"]), &[Type::Param("T".to_string())]);
        assert_eq!(bindings.resolve("E"), Some(&Type::int()));
        bindings.pop_scope(inner);
        bindings.pop_scope(outer);
    }

    #[test]
    fn unbound_parameters_stay_in_place() {
        let bindings = GenericBindings::new();
        let typ = Type::Param("T".to_string());
        assert_eq!(bindings.concretize(&typ), typ);
    }
}
