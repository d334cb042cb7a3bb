//! Proxy graph mapper
//!
//! Rewrites values crossing the proxy boundary. The forward direction
//! replaces registered provider instances with proxies and narrows arrays of
//! provider types to their registered supertype; the backward direction
//! unwraps proxies and restores the original array element types.
//!
//! Graph values may reference themselves, so every rewrite threads a map of
//! already rewritten graphs keyed by graph identity. A graph without anything
//! to rewrite is returned as is, preserving its identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::declarations::Declarations;
use crate::error::{ReplayCompError, Result};
use crate::provider::ProviderRef;
use crate::value::{ArrayValue, ElementType, GraphNode, GraphRef, ValueGraph, Value};

type GraphMap = HashMap<usize, Arc<ValueGraph>>;

/// Substitutes proxies for provider instances and back
#[derive(Debug, Clone, Copy)]
pub struct ProxyGraphMapper<'a> {
    declarations: &'a Declarations,
}

impl<'a> ProxyGraphMapper<'a> {
    pub fn new(declarations: &'a Declarations) -> Self {
        Self { declarations }
    }

    /// Replace every registered provider instance inside `value` with the
    /// proxy returned by `proxify`
    ///
    /// Proxies are left alone. A provider whose type has no registration is
    /// rejected, since it could not be reproduced later.
    pub fn substitute_forward<F>(&self, value: &Value, proxify: &mut F) -> Result<Value>
    where
        F: FnMut(&ProviderRef) -> Result<ProviderRef>,
    {
        let mut graphs = GraphMap::new();
        self.forward(value, proxify, &mut graphs)
    }

    fn forward<F>(&self, value: &Value, proxify: &mut F, graphs: &mut GraphMap) -> Result<Value>
    where
        F: FnMut(&ProviderRef) -> Result<ProviderRef>,
    {
        match value {
            Value::Provider(provider) if provider.is_proxy() => Ok(value.clone()),
            Value::Provider(provider) => {
                if !self.declarations.is_registered_instance(provider) {
                    return Err(ReplayCompError::UnregisteredProvider {
                        type_name: provider.provider_type().name().to_string(),
                    });
                }
                Ok(Value::Provider(proxify(provider)?))
            }
            Value::Array(array) => {
                let narrowed = match array.element() {
                    ElementType::Provider(ty) => self
                        .declarations
                        .find_registered_supertype(ty)
                        .filter(|declared| declared != ty)
                        .map(ElementType::Provider),
                    ElementType::Named(_) => None,
                };
                let items = array
                    .items()
                    .iter()
                    .map(|item| self.forward(item, proxify, graphs))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(match narrowed {
                    Some(element) => ArrayValue::rewritten(
                        element,
                        Some(
                            array
                                .original_element()
                                .unwrap_or(array.element())
                                .clone(),
                        ),
                        items,
                    ),
                    None => ArrayValue::rewritten(
                        array.element().clone(),
                        array.original_element().cloned(),
                        items,
                    ),
                }))
            }
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.forward(item, proxify, graphs))
                    .collect::<Result<_>>()?,
            )),
            Value::Record(record) => Ok(Value::record(
                record.rebuild(&mut |v: &Value| self.forward(v, proxify, graphs))?,
            )),
            Value::Graph(graph_ref) => {
                let graph = self.forward_graph(graph_ref.graph(), proxify, graphs)?;
                Ok(Value::Graph(GraphRef::new(graph, graph_ref.index())))
            }
            Value::Delayed(delayed) => self.forward(&delayed.materialize(), proxify, graphs),
            _ => Ok(value.clone()),
        }
    }

    fn forward_graph<F>(
        &self,
        graph: &Arc<ValueGraph>,
        proxify: &mut F,
        graphs: &mut GraphMap,
    ) -> Result<Arc<ValueGraph>>
    where
        F: FnMut(&ProviderRef) -> Result<ProviderRef>,
    {
        if let Some(mapped) = graphs.get(&graph.addr()) {
            return Ok(Arc::clone(mapped));
        }
        if is_plain_graph(graph) {
            graphs.insert(graph.addr(), Arc::clone(graph));
            return Ok(Arc::clone(graph));
        }
        let mapped = ValueGraph::pending();
        graphs.insert(graph.addr(), Arc::clone(&mapped));
        let nodes = graph
            .nodes()
            .iter()
            .map(|node| {
                Ok(GraphNode::new(
                    node.label(),
                    self.forward(node.payload(), proxify, graphs)?,
                    node.links().to_vec(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        mapped.complete(nodes)?;
        Ok(mapped)
    }

    /// Unwrap proxies inside `value` and restore original array element types
    ///
    /// Returns `None` when some proxy has no backing instance, which means the
    /// value cannot be handed to a real provider.
    pub fn substitute_backward(&self, value: &Value) -> Option<Value> {
        let mut graphs = GraphMap::new();
        backward(value, &mut graphs)
    }
}

fn backward(value: &Value, graphs: &mut GraphMap) -> Option<Value> {
    match value {
        Value::Provider(provider) if provider.is_proxy() => {
            provider.unproxify().map(Value::Provider)
        }
        Value::Array(array) => {
            let items = array
                .items()
                .iter()
                .map(|item| backward(item, graphs))
                .collect::<Option<Vec<_>>>()?;
            let element = array
                .original_element()
                .unwrap_or(array.element())
                .clone();
            Some(Value::Array(ArrayValue::rewritten(element, None, items)))
        }
        Value::List(items) => Some(Value::List(
            items
                .iter()
                .map(|item| backward(item, graphs))
                .collect::<Option<_>>()?,
        )),
        Value::Record(record) => record
            .rebuild(&mut |v: &Value| backward(v, graphs).ok_or(()))
            .ok()
            .map(Value::record),
        Value::Graph(graph_ref) => {
            let graph = backward_graph(graph_ref.graph(), graphs)?;
            Some(Value::Graph(GraphRef::new(graph, graph_ref.index())))
        }
        Value::Delayed(delayed) => backward(&delayed.materialize(), graphs),
        _ => Some(value.clone()),
    }
}

fn backward_graph(graph: &Arc<ValueGraph>, graphs: &mut GraphMap) -> Option<Arc<ValueGraph>> {
    if let Some(mapped) = graphs.get(&graph.addr()) {
        return Some(Arc::clone(mapped));
    }
    if is_plain_graph(graph) {
        graphs.insert(graph.addr(), Arc::clone(graph));
        return Some(Arc::clone(graph));
    }
    let mapped = ValueGraph::pending();
    graphs.insert(graph.addr(), Arc::clone(&mapped));
    let nodes = graph
        .nodes()
        .iter()
        .map(|node| {
            Some(GraphNode::new(
                node.label(),
                backward(node.payload(), graphs)?,
                node.links().to_vec(),
            ))
        })
        .collect::<Option<Vec<_>>>()?;
    mapped.complete(nodes).ok()?;
    Some(mapped)
}

/// Whether nothing inside the graph is subject to rewriting
fn is_plain_graph(graph: &Arc<ValueGraph>) -> bool {
    let mut seen = HashSet::new();
    seen.insert(graph.addr());
    graph
        .nodes()
        .iter()
        .all(|node| is_plain(node.payload(), &mut seen))
}

fn is_plain(value: &Value, seen: &mut HashSet<usize>) -> bool {
    match value {
        Value::Provider(_) | Value::Delayed(_) => false,
        Value::Array(array) => {
            matches!(array.element(), ElementType::Named(_))
                && array.original_element().is_none()
                && array.items().iter().all(|item| is_plain(item, seen))
        }
        Value::List(items) => items.iter().all(|item| is_plain(item, seen)),
        Value::Record(record) => record.children().into_iter().all(|child| is_plain(child, seen)),
        Value::Graph(graph_ref) => {
            let graph = graph_ref.graph();
            if !seen.insert(graph.addr()) {
                return true;
            }
            graph.nodes().iter().all(|node| is_plain(node.payload(), seen))
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarations::{Registration, RegistrationBuilder};
    use crate::provider::{Provider, ProxyObject};
    use crate::stub::StubProvider;
    use crate::value::{Operation, Record, ThrownError, TypeDescriptor};

    #[derive(Debug)]
    struct Wrapper {
        registration: Arc<Registration>,
        inner: ProviderRef,
    }

    impl Provider for Wrapper {
        fn provider_type(&self) -> TypeDescriptor {
            self.registration.provider_type().clone()
        }

        fn invoke(&self, operation: &Operation, args: &[Value]) -> std::result::Result<Value, ThrownError> {
            self.inner.invoke(operation, args)
        }

        fn as_proxy(&self) -> Option<&dyn ProxyObject> {
            Some(self)
        }
    }

    impl ProxyObject for Wrapper {
        fn registration(&self) -> &Arc<Registration> {
            &self.registration
        }

        fn backing_instance(&self) -> Option<ProviderRef> {
            Some(self.inner.clone())
        }
    }

    fn setup() -> (Declarations, TypeDescriptor, TypeDescriptor) {
        let declared = TypeDescriptor::new("ResolvedType");
        let concrete = TypeDescriptor::with_supertypes("HotSpotType", [declared.clone()]);
        let declarations = Declarations::builder()
            .register(RegistrationBuilder::new(declared.clone()))
            .unwrap()
            .build();
        (declarations, declared, concrete)
    }

    fn wrapping(declarations: &Declarations) -> impl FnMut(&ProviderRef) -> Result<ProviderRef> + '_ {
        move |instance: &ProviderRef| {
            let registration = declarations
                .find_registration_for_instance(instance)
                .cloned()
                .ok_or_else(|| ReplayCompError::Other("unregistered".into()))?;
            Ok(ProviderRef::new(Wrapper {
                registration,
                inner: instance.clone(),
            }))
        }
    }

    #[test]
    fn test_forward_then_backward_restores_instances() {
        let (declarations, declared, concrete) = setup();
        let mapper = ProxyGraphMapper::new(&declarations);
        let instance = StubProvider::new(concrete.clone(), "int[]").into_ref();

        let value = Value::list([
            Value::Provider(instance.clone()),
            Value::array(
                ElementType::Provider(concrete.clone()),
                [Value::Provider(instance.clone()), Value::Null],
            ),
            Value::Int(3),
        ]);

        let forward = mapper
            .substitute_forward(&value, &mut wrapping(&declarations))
            .unwrap();
        let Value::List(items) = &forward else {
            panic!("expected a list");
        };
        let proxy = items[0].as_provider().unwrap();
        assert!(proxy.is_proxy());
        let Value::Array(array) = &items[1] else {
            panic!("expected an array");
        };
        assert_eq!(array.element(), &ElementType::Provider(declared));
        assert_eq!(array.original_element(), Some(&ElementType::Provider(concrete.clone())));

        let backward = mapper.substitute_backward(&forward).unwrap();
        assert_eq!(backward, value);
        let Value::List(items) = &backward else {
            panic!("expected a list");
        };
        let Value::Array(array) = &items[1] else {
            panic!("expected an array");
        };
        assert_eq!(array.element(), &ElementType::Provider(concrete));
        assert_eq!(items[0].as_provider(), Some(&instance));
    }

    #[test]
    fn test_unregistered_provider_rejected() {
        let (declarations, _, _) = setup();
        let mapper = ProxyGraphMapper::new(&declarations);
        let stranger = StubProvider::new(TypeDescriptor::new("Unrelated"), "x").into_ref();

        let result = mapper.substitute_forward(
            &Value::list([Value::Provider(stranger)]),
            &mut wrapping(&declarations),
        );
        assert!(matches!(
            result,
            Err(ReplayCompError::UnregisteredProvider { ref type_name }) if type_name == "Unrelated"
        ));
    }

    #[test]
    fn test_records_are_rewritten() {
        let (declarations, _, concrete) = setup();
        let mapper = ProxyGraphMapper::new(&declarations);
        let instance = StubProvider::new(concrete, "T").into_ref();
        let value = Value::record(Record::UnresolvedMethod {
            holder: Value::Provider(instance.clone()),
            name: Arc::from("run"),
            signature: Arc::from("()V"),
        });

        let forward = mapper
            .substitute_forward(&value, &mut wrapping(&declarations))
            .unwrap();
        let Value::Record(record) = &forward else {
            panic!("expected a record");
        };
        assert!(record.children()[0].as_provider().unwrap().is_proxy());
        assert_eq!(mapper.substitute_backward(&forward), Some(value));
    }

    #[test]
    fn test_self_referential_graph_terminates() {
        let (declarations, _, concrete) = setup();
        let mapper = ProxyGraphMapper::new(&declarations);
        let instance = StubProvider::new(concrete, "T").into_ref();

        let mut builder = ValueGraph::builder();
        let graph_slot = builder.node("holder", Value::Provider(instance.clone()));
        builder.link(graph_slot, graph_slot);
        let graph = builder.build().unwrap();
        let value = Value::Graph(GraphRef::new(Arc::clone(&graph), graph_slot));

        let forward = mapper
            .substitute_forward(&value, &mut wrapping(&declarations))
            .unwrap();
        let Value::Graph(mapped) = &forward else {
            panic!("expected a graph");
        };
        assert!(!Arc::ptr_eq(mapped.graph(), &graph));
        assert_eq!(mapped.linked(), vec![mapped.clone()]);
        assert!(mapped.node().unwrap().payload().as_provider().unwrap().is_proxy());

        let Some(Value::Graph(restored)) = mapper.substitute_backward(&forward) else {
            panic!("expected a graph");
        };
        assert_eq!(restored.node().unwrap().payload().as_provider(), Some(&instance));
    }

    #[test]
    fn test_plain_graph_keeps_identity() {
        let (declarations, _, _) = setup();
        let mapper = ProxyGraphMapper::new(&declarations);
        let mut builder = ValueGraph::builder();
        let a = builder.node("a", Value::Int(1));
        let b = builder.node("b", Value::str("two"));
        builder.link(a, b).link(b, a);
        let graph = builder.build().unwrap();
        let value = Value::Graph(GraphRef::new(graph, a));

        let forward = mapper
            .substitute_forward(&value, &mut wrapping(&declarations))
            .unwrap();
        assert_eq!(forward, value);
    }

    #[test]
    fn test_proxy_without_backing_instance() {
        #[derive(Debug)]
        struct Detached(Arc<Registration>);

        impl Provider for Detached {
            fn provider_type(&self) -> TypeDescriptor {
                self.0.provider_type().clone()
            }

            fn invoke(&self, _: &Operation, _: &[Value]) -> std::result::Result<Value, ThrownError> {
                Ok(Value::Null)
            }

            fn as_proxy(&self) -> Option<&dyn ProxyObject> {
                Some(self)
            }
        }

        impl ProxyObject for Detached {
            fn registration(&self) -> &Arc<Registration> {
                &self.0
            }

            fn backing_instance(&self) -> Option<ProviderRef> {
                None
            }
        }

        let (declarations, declared, _) = setup();
        let mapper = ProxyGraphMapper::new(&declarations);
        let registration = Arc::clone(declarations.registration(&declared).unwrap());
        let proxy = ProviderRef::new(Detached(registration));

        assert_eq!(mapper.substitute_backward(&Value::Provider(proxy)), None);
        assert_eq!(
            mapper.substitute_backward(&Value::Int(4)),
            Some(Value::Int(4))
        );
    }
}
