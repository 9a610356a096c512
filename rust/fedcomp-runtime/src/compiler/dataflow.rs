//! Normalization of building blocks into a dataflow graph.
//!
//! The body of a computation is evaluated symbolically: lambdas that are called get inlined,
//! blocks are flattened and selections from structs whose shape is known are resolved on the
//! spot. What remains are the calls of intrinsics and local computations, which become the nodes
//! of the graph, in the order they are encountered. A node only ever depends on nodes created
//! before it.
//!
//! Resolving selections eagerly is what keeps packaging from creating dependencies: a value that
//! is put into a struct and selected away again never reaches the node consuming the selection.

use std::sync::Arc;

use fedcomp_core::{
    building_blocks::BuildingBlock,
    intrinsics::Intrinsic,
    types::{Container, Type},
    value::Value,
    Computation,
};

use super::MergeableFormError;

pub(crate) type NodeId = usize;

#[derive(Clone, Debug)]
/// A symbolic value.
pub(crate) enum Sym {
    /// A non-struct leaf of the computation parameter.
    Param { path: Vec<usize>, ty: Type },
    /// (A part of) the output of a node.
    Output {
        node: NodeId,
        path: Vec<usize>,
        ty: Type,
    },
    Literal { value: Value, ty: Type },
    Struct {
        elements: Vec<(Option<String>, Sym)>,
        container: Container,
    },
    Function(FunctionSym),
}

#[derive(Clone, Debug)]
pub(crate) enum FunctionSym {
    Lambda {
        parameter: Option<String>,
        body: Arc<BuildingBlock>,
        env: Env,
        /// The lambda itself, rendered back when the lambda is passed to an intrinsic.
        building_block: Arc<BuildingBlock>,
    },
    /// An intrinsic or local computation.
    Opaque(Arc<BuildingBlock>),
}

impl Sym {
    pub(crate) fn ty(&self) -> Type {
        match self {
            Sym::Param { ty, .. } | Sym::Output { ty, .. } | Sym::Literal { ty, .. } => ty.clone(),
            Sym::Struct {
                elements,
                container,
            } => Type::structure(
                elements
                    .iter()
                    .map(|(name, element)| (name.clone(), element.ty()))
                    .collect(),
                *container,
            ),
            Sym::Function(FunctionSym::Lambda { building_block, .. })
            | Sym::Function(FunctionSym::Opaque(building_block)) => {
                building_block.type_signature().clone()
            }
        }
    }

    /// Visits the leaves of the symbolic value.
    pub(crate) fn for_each_leaf<'a>(&'a self, visit: &mut dyn FnMut(&'a Sym)) {
        match self {
            Sym::Struct { elements, .. } => elements
                .iter()
                .for_each(|(_, element)| element.for_each_leaf(visit)),
            leaf => visit(leaf),
        }
    }

    /// Collects the nodes the symbolic value reads from.
    pub(crate) fn inputs(&self) -> Vec<NodeId> {
        let mut inputs = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Sym::Output { node, .. } = leaf {
                inputs.push(*node);
            }
        });
        inputs
    }

    fn select(self, index: usize) -> Result<Sym, MergeableFormError> {
        match self {
            Sym::Struct { mut elements, .. } => {
                let len = elements.len();
                if index >= len {
                    return Err(
                        fedcomp_core::types::TypeError::IndexOutOfRange { index, len }.into(),
                    );
                }
                Ok(elements.swap_remove(index).1)
            }
            Sym::Output { node, mut path, ty } => {
                let ty = ty.element(index)?.clone();
                path.push(index);
                Ok(Sym::Output { node, path, ty })
            }
            Sym::Literal { value, ty } => {
                let element_ty = ty.element(index)?.clone();
                let element = value
                    .element(index)
                    .cloned()
                    .ok_or_else(|| {
                        MergeableFormError::Unsupported(format!("selection from literal {}", ty))
                    })?;
                Ok(Sym::Literal {
                    value: element,
                    ty: element_ty,
                })
            }
            Sym::Param { ty, .. } => Err(MergeableFormError::Unsupported(format!(
                "selection from non-struct parameter {}",
                ty
            ))),
            Sym::Function(_) => Err(MergeableFormError::Unsupported(
                "selection from a function".into(),
            )),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Env(Option<Arc<EnvBinding>>);

#[derive(Debug)]
pub(crate) struct EnvBinding {
    name: String,
    value: Sym,
    parent: Env,
}

impl Env {
    fn bind(&self, name: &str, value: Sym) -> Env {
        Env(Some(Arc::new(EnvBinding {
            name: name.to_string(),
            value,
            parent: self.clone(),
        })))
    }

    fn lookup(&self, name: &str) -> Option<&Sym> {
        let mut env = self;
        while let Some(binding) = &env.0 {
            if binding.name == name {
                return Some(&binding.value);
            }
            env = &binding.parent;
        }
        None
    }
}

#[derive(Debug)]
/// A call of an intrinsic or a local computation.
pub(crate) struct Node {
    pub function: Arc<BuildingBlock>,
    pub argument: Option<Sym>,
    pub ty: Type,
}

impl Node {
    pub(crate) fn intrinsic(&self) -> Option<Intrinsic> {
        match self.function.as_ref() {
            BuildingBlock::Intrinsic { intrinsic, .. } => Some(*intrinsic),
            _ => None,
        }
    }

    pub(crate) fn is_aggregation(&self) -> bool {
        self.intrinsic().map_or(false, Intrinsic::is_aggregation)
    }

    pub(crate) fn inputs(&self) -> Vec<NodeId> {
        self.argument.as_ref().map(Sym::inputs).unwrap_or_default()
    }
}

#[derive(Debug)]
/// The normalized form of a computation.
pub(crate) struct DataflowGraph {
    pub parameter: Option<Type>,
    pub nodes: Vec<Node>,
    pub result: Sym,
}

impl DataflowGraph {
    /// Normalizes the body of `computation`.
    pub(crate) fn build(computation: &Computation) -> Result<Self, MergeableFormError> {
        let mut builder = Builder { nodes: Vec::new() };
        let function = builder.evaluate(computation.building_block(), &Env::default())?;
        let parameter = computation.parameter_type().cloned();
        let argument = parameter.as_ref().map(|ty| parameter_sym(ty, Vec::new()));
        let result = builder.apply(function, argument)?;

        let mut returns_function = false;
        result.for_each_leaf(&mut |leaf| returns_function |= matches!(leaf, Sym::Function(_)));
        if returns_function {
            return Err(MergeableFormError::Unsupported(
                "computations returning functions".into(),
            ));
        }

        Ok(Self {
            parameter,
            nodes: builder.nodes,
            result,
        })
    }
}

fn parameter_sym(ty: &Type, path: Vec<usize>) -> Sym {
    match ty {
        Type::Struct(struct_ty) => Sym::Struct {
            elements: struct_ty
                .elements
                .iter()
                .enumerate()
                .map(|(index, (name, ty))| {
                    let mut path = path.clone();
                    path.push(index);
                    (name.clone(), parameter_sym(ty, path))
                })
                .collect(),
            container: struct_ty.container,
        },
        ty => Sym::Param {
            path,
            ty: ty.clone(),
        },
    }
}

struct Builder {
    nodes: Vec<Node>,
}

impl Builder {
    fn evaluate(
        &mut self,
        building_block: &Arc<BuildingBlock>,
        env: &Env,
    ) -> Result<Sym, MergeableFormError> {
        match building_block.as_ref() {
            BuildingBlock::Reference { name, .. } => env
                .lookup(name)
                .cloned()
                .ok_or_else(|| {
                    MergeableFormError::Unsupported(format!("unbound reference `{}`", name))
                }),
            BuildingBlock::Selection { source, index, .. } => {
                self.evaluate(source, env)?.select(*index)
            }
            BuildingBlock::Struct { elements, ty } => {
                let container = ty.as_struct().map(|ty| ty.container).unwrap_or_default();
                let elements = elements
                    .iter()
                    .map(|(name, element)| Ok((name.clone(), self.evaluate(element, env)?)))
                    .collect::<Result<_, MergeableFormError>>()?;
                Ok(Sym::Struct {
                    elements,
                    container,
                })
            }
            BuildingBlock::Call {
                function, argument, ..
            } => {
                let function = self.evaluate(function, env)?;
                let argument = argument
                    .as_ref()
                    .map(|argument| self.evaluate(argument, env))
                    .transpose()?;
                self.apply(function, argument)
            }
            BuildingBlock::Lambda {
                parameter, result, ..
            } => Ok(Sym::Function(FunctionSym::Lambda {
                parameter: parameter.as_ref().map(|(name, _)| name.clone()),
                body: result.clone(),
                env: env.clone(),
                building_block: building_block.clone(),
            })),
            BuildingBlock::Block { locals, result } => {
                let mut env = env.clone();
                for (name, local) in locals {
                    let value = self.evaluate(local, &env)?;
                    env = env.bind(name, value);
                }
                self.evaluate(result, &env)
            }
            BuildingBlock::Data { value, ty } => Ok(Sym::Literal {
                value: value.clone(),
                ty: ty.clone(),
            }),
            BuildingBlock::Intrinsic { .. } | BuildingBlock::Local(_) => {
                Ok(Sym::Function(FunctionSym::Opaque(building_block.clone())))
            }
        }
    }

    fn apply(&mut self, function: Sym, argument: Option<Sym>) -> Result<Sym, MergeableFormError> {
        let function = match function {
            Sym::Function(function) => function,
            other => {
                return Err(MergeableFormError::Unsupported(format!(
                    "call of a non-function value of type {}",
                    other.ty()
                )))
            }
        };
        match function {
            FunctionSym::Lambda {
                parameter,
                body,
                env,
                ..
            } => {
                let env = match (parameter, argument) {
                    (Some(name), Some(argument)) => env.bind(&name, argument),
                    (None, None) => env,
                    _ => {
                        return Err(MergeableFormError::Unsupported(
                            "lambda called with a mismatching argument".into(),
                        ))
                    }
                };
                self.evaluate(&body, &env)
            }
            FunctionSym::Opaque(function) => {
                if let Some(argument) = &argument {
                    check_closed_functions(argument)?;
                }
                let ty = function
                    .type_signature()
                    .as_function()
                    .map(|ty| ty.result().clone())
                    .ok_or_else(|| {
                        MergeableFormError::Unsupported("call of a non-function".into())
                    })?;
                let node = self.nodes.len();
                self.nodes.push(Node {
                    function,
                    argument,
                    ty: ty.clone(),
                });
                Ok(Sym::Output {
                    node,
                    path: Vec::new(),
                    ty,
                })
            }
        }
    }
}

/// Checks that the lambdas handed to an intrinsic don't capture anything.
fn check_closed_functions(argument: &Sym) -> Result<(), MergeableFormError> {
    let mut captured = Vec::new();
    argument.for_each_leaf(&mut |leaf| {
        if let Sym::Function(FunctionSym::Lambda { building_block, .. }) = leaf {
            captured.extend(building_block.free_variables());
        }
    });
    if captured.is_empty() {
        Ok(())
    } else {
        Err(MergeableFormError::UnsupportedFunctionArgument(captured))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedcomp_core::testutils::{
        aggregation_and_after,
        false_aggregation_dependence,
        return_list,
        tf_multiply_int,
    };

    #[test]
    fn test_standalone_local_computation_is_a_single_node() {
        let graph = DataflowGraph::build(&tf_multiply_int()).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert!(matches!(graph.result, Sym::Output { node: 0, .. }));
    }

    #[test]
    fn test_packaging_without_calls_needs_no_nodes() {
        let graph = DataflowGraph::build(&return_list()).unwrap();
        assert!(graph.nodes.is_empty());
        match graph.result {
            Sym::Struct {
                elements,
                container,
            } => {
                assert_eq!(container, Container::List);
                assert!(matches!(elements[0].1, Sym::Param { ref path, .. } if path == &[0]));
                assert!(matches!(elements[1].1, Sym::Param { ref path, .. } if path == &[1]));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_nodes_are_created_in_post_order() {
        let graph = DataflowGraph::build(&aggregation_and_after()).unwrap();
        let intrinsics: Vec<_> = graph.nodes.iter().map(Node::intrinsic).collect();
        assert_eq!(
            intrinsics,
            vec![
                Some(Intrinsic::FederatedSum),
                Some(Intrinsic::FederatedZipAtServer),
                Some(Intrinsic::FederatedApply),
            ]
        );
        for (id, node) in graph.nodes.iter().enumerate() {
            assert!(node.inputs().iter().all(|input| *input < id));
        }
    }

    #[test]
    fn test_inlined_call_resolves_selection() {
        let graph = DataflowGraph::build(&false_aggregation_dependence()).unwrap();
        let sums: Vec<NodeId> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.intrinsic() == Some(Intrinsic::FederatedSum))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(sums.len(), 2);
        // the second sum reads the mapped client values, not the broadcast
        let second = &graph.nodes[sums[1]];
        assert_eq!(second.inputs(), vec![0]);
        assert_eq!(graph.nodes[0].intrinsic(), Some(Intrinsic::FederatedMap));
    }
}
