//! Lowering of a region into tasks and slots.
//!
//! Every call to a nested graph gets its own scope. Parameters and captures
//! of the callee alias the caller's argument slots, and the call's outputs
//! alias the callee's output slots, so a call adds no tasks of its own.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::{BackendPlan, Dispatch, PlanInput};
use crate::dtype::DType;
use crate::error::AdError;
use crate::graph::{Graph, Node, NodeId, VarId, Variable};
use crate::ops::Op;
use crate::shape::{self, Meta};
use crate::tensor::Tensor;

pub(crate) type ScopeId = usize;

/// Scope of the region itself.
pub(crate) const ROOT_SCOPE: ScopeId = 0;

#[derive(Debug)]
pub(crate) struct SlotInfo {
    pub var: Variable,
    /// Value known before execution starts.
    pub external: Option<Arc<Tensor>>,
    pub producer: Option<usize>,
    /// Distinct tasks reading the slot.
    pub consumers: Vec<usize>,
    pub pinned: bool,
}

#[derive(Debug)]
pub(crate) struct TaskInfo {
    pub node: Arc<Node>,
    pub scope: ScopeId,
    pub plan: Arc<BackendPlan>,
    /// One slot per node input, in input order.
    pub inputs: Vec<usize>,
    pub output: usize,
    /// Result shape and dtype of each plan step.
    pub metas: Vec<(Vec<usize>, DType)>,
}

impl TaskInfo {
    /// Input slots without repeats.
    pub fn distinct_inputs(&self) -> Vec<usize> {
        let mut seen = Vec::with_capacity(self.inputs.len());
        for &s in &self.inputs {
            if !seen.contains(&s) {
                seen.push(s);
            }
        }
        seen
    }
}

#[derive(Debug, Default)]
pub(crate) struct Program {
    pub slots: Vec<SlotInfo>,
    pub tasks: Vec<TaskInfo>,
    index: HashMap<(ScopeId, VarId), usize>,
    call_scopes: HashMap<(ScopeId, NodeId), ScopeId>,
    node_tasks: HashMap<(ScopeId, NodeId), usize>,
    scopes: usize,
}

impl Program {
    /// Lower `nodes` with `bindings` as the values of otherwise unbound
    /// variables (graph parameters and capture placeholders).
    pub fn lower(
        dispatch: &Dispatch,
        nodes: &[Arc<Node>],
        bindings: &[(Variable, Arc<Tensor>)],
        requested: &[Variable],
        retain_for_backward: bool,
    ) -> Result<Program, AdError> {
        let mut program = Program {
            scopes: 1,
            ..Program::default()
        };
        for (var, value) in bindings {
            if value.shape() != var.shape() || value.dtype() != var.dtype() {
                return Err(AdError::shape(
                    "bind",
                    format!(
                        "{} is {:?} {} but was bound to {:?} {}",
                        var.id(),
                        var.shape(),
                        var.dtype(),
                        value.shape(),
                        value.dtype()
                    ),
                ));
            }
            program.external(ROOT_SCOPE, var, value.clone());
        }
        program.lower_scope(dispatch, ROOT_SCOPE, nodes)?;

        for var in requested {
            let slot = program.resolve(ROOT_SCOPE, var)?;
            program.slots[slot].pinned = true;
        }
        if retain_for_backward {
            program.pin_saved();
        }
        for t in 0..program.tasks.len() {
            for s in program.tasks[t].distinct_inputs() {
                program.slots[s].consumers.push(t);
            }
        }
        Ok(program)
    }

    /// Slot holding `var` in `scope`, if lowered.
    pub fn slot_of(&self, scope: ScopeId, var: &Variable) -> Option<usize> {
        self.index.get(&(scope, var.id())).copied()
    }

    /// Scope created for the call `node` made from `scope`.
    pub fn call_scope(&self, scope: ScopeId, node: NodeId) -> Option<ScopeId> {
        self.call_scopes.get(&(scope, node)).copied()
    }

    /// Task running `node` in `scope`.
    pub fn task_of(&self, scope: ScopeId, node: NodeId) -> Option<usize> {
        self.node_tasks.get(&(scope, node)).copied()
    }

    fn external(&mut self, scope: ScopeId, var: &Variable, value: Arc<Tensor>) -> usize {
        let slot = self.slots.len();
        self.slots.push(SlotInfo {
            var: var.clone(),
            external: Some(value),
            producer: None,
            consumers: Vec::new(),
            pinned: false,
        });
        self.index.insert((scope, var.id()), slot);
        slot
    }

    fn resolve(&mut self, scope: ScopeId, var: &Variable) -> Result<usize, AdError> {
        if let Some(slot) = self.slot_of(scope, var) {
            return Ok(slot);
        }
        match var.value() {
            Some(value) => Ok(self.external(scope, var, value.clone())),
            None => Err(AdError::InvalidOperation(format!(
                "{} is neither produced in this region nor has a value",
                var.id()
            ))),
        }
    }

    fn lower_scope(
        &mut self,
        dispatch: &Dispatch,
        scope: ScopeId,
        nodes: &[Arc<Node>],
    ) -> Result<(), AdError> {
        for node in nodes {
            match node.op() {
                Op::Call(graph) => self.lower_call(dispatch, scope, node, graph)?,
                _ => self.lower_node(dispatch, scope, node)?,
            }
        }
        Ok(())
    }

    fn lower_call(
        &mut self,
        dispatch: &Dispatch,
        scope: ScopeId,
        node: &Arc<Node>,
        graph: &Arc<Graph>,
    ) -> Result<(), AdError> {
        let child = self.scopes;
        self.scopes += 1;
        self.call_scopes.insert((scope, node.id()), child);

        let inner = graph
            .params()
            .iter()
            .chain(graph.captures().iter().map(|c| &c.inner));
        for (placeholder, arg) in inner.zip(node.inputs()) {
            let slot = self.resolve(scope, arg)?;
            self.index.insert((child, placeholder.id()), slot);
        }
        self.lower_scope(dispatch, child, graph.nodes())?;
        for (inner, outer) in graph.outputs().iter().zip(node.outputs()) {
            let slot = self.resolve(child, inner)?;
            self.index.insert((scope, outer.id()), slot);
        }
        Ok(())
    }

    fn lower_node(
        &mut self,
        dispatch: &Dispatch,
        scope: ScopeId,
        node: &Arc<Node>,
    ) -> Result<(), AdError> {
        let inputs = node
            .inputs()
            .iter()
            .map(|v| self.resolve(scope, v))
            .collect::<Result<Vec<_>, _>>()?;
        let dtypes: Vec<DType> = node.inputs().iter().map(Variable::dtype).collect();
        let plan = dispatch.select(node.op(), &dtypes, node.backend())?;
        let metas = step_metas(&plan, node.inputs())?;

        let output = node.outputs().first().ok_or_else(|| {
            AdError::InternalConsistency(format!("{} has no output", node.id()))
        })?;
        let task = self.tasks.len();
        let slot = self.slots.len();
        self.slots.push(SlotInfo {
            var: output.clone(),
            external: None,
            producer: Some(task),
            consumers: Vec::new(),
            pinned: false,
        });
        self.index.insert((scope, output.id()), slot);
        self.node_tasks.insert((scope, node.id()), task);
        self.tasks.push(TaskInfo {
            node: node.clone(),
            scope,
            plan,
            inputs,
            output: slot,
            metas,
        });
        Ok(())
    }

    fn pin_saved(&mut self) {
        let mut pins = Vec::new();
        for task in &self.tasks {
            for (i, &slot) in task.inputs.iter().enumerate() {
                if task.node.needs_input_for_backward(i) {
                    pins.push(slot);
                }
            }
            if task.node.needs_output_for_backward(0) {
                pins.push(task.output);
            }
        }
        for slot in pins {
            self.slots[slot].pinned = true;
        }
    }
}

fn step_metas(
    plan: &BackendPlan,
    operands: &[Variable],
) -> Result<Vec<(Vec<usize>, DType)>, AdError> {
    let mut metas: Vec<(Vec<usize>, DType)> = Vec::with_capacity(plan.steps().len());
    for step in plan.steps() {
        let inputs = step
            .inputs
            .iter()
            .map(|input| match *input {
                PlanInput::Operand(i) => operands.get(i).map(|v| (v.shape(), v.dtype())),
                PlanInput::Step(j) => metas.get(j).map(|(s, d)| (s.as_slice(), *d)),
            })
            .collect::<Option<Vec<Meta<'_>>>>()
            .ok_or_else(|| {
                AdError::InternalConsistency(format!("dangling operand in {} plan", step.op))
            })?;
        let meta = shape::infer(&step.op, &inputs)?;
        metas.push(meta);
    }
    Ok(metas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::graph::{Tape, VarType};

    fn tape() -> Tape {
        let dispatch = Dispatch::new(vec![Arc::new(CpuBackend::new("cpu"))]).unwrap();
        Tape::new(Arc::new(dispatch))
    }

    #[test]
    fn test_consumers_are_distinct_tasks() {
        let mut tape = tape();
        let x = tape.leaf(Tensor::ones(&[2], DType::F64), false);
        let y = tape.add(&x, &x).unwrap();
        let _ = tape.mul(&y, &x).unwrap();
        let region = tape.close();

        let program =
            Program::lower(tape.dispatch(), region.nodes(), &[], &[], false).unwrap();
        assert_eq!(program.tasks.len(), 2);
        let xs = program.slot_of(ROOT_SCOPE, &x).unwrap();
        assert_eq!(program.slots[xs].consumers, vec![0, 1]);
        assert!(program.slots[xs].external.is_some());
        assert_eq!(program.tasks[0].distinct_inputs(), vec![xs]);
    }

    #[test]
    fn test_composite_step_metas() {
        let mut tape = tape();
        let a = tape.leaf(Tensor::ones(&[3], DType::F32), false);
        let b = tape.leaf(Tensor::ones(&[3], DType::F32), false);
        let _ = tape.sub(&a, &b).unwrap();
        let region = tape.close();

        let program =
            Program::lower(tape.dispatch(), region.nodes(), &[], &[], false).unwrap();
        assert_eq!(program.tasks[0].metas.len(), 2);
        assert!(program.tasks[0].metas.iter().all(|(s, d)| s == &[3] && *d == DType::F32));
    }

    #[test]
    fn test_call_aliases_slots() {
        let mut tape = tape();
        let x = tape.leaf(Tensor::ones(&[2], DType::F64), true);
        let f = tape
            .function("f", &[VarType::new(&[2], DType::F64)], |body, p| {
                Ok(vec![body.exp(&p[0])?])
            })
            .unwrap();
        let out = tape.call(&f, &[x.clone()]).unwrap();
        let region = tape.close();

        let program = Program::lower(
            tape.dispatch(),
            region.nodes(),
            &[],
            std::slice::from_ref(&out[0]),
            false,
        )
        .unwrap();
        assert_eq!(program.tasks.len(), 1);
        let call = tape.producer_of(&out[0]).unwrap().id();
        let child = program.call_scope(ROOT_SCOPE, call).unwrap();
        assert_ne!(child, ROOT_SCOPE);
        assert_eq!(
            program.slot_of(child, &f.params()[0]),
            program.slot_of(ROOT_SCOPE, &x)
        );
        assert_eq!(
            program.slot_of(ROOT_SCOPE, &out[0]),
            program.slot_of(child, &f.outputs()[0])
        );
        assert!(program.slots[program.tasks[0].output].pinned);
    }

    #[test]
    fn test_unbound_variable_rejected() {
        let tape = tape();
        let f = tape
            .function("f", &[VarType::new(&[2], DType::F64)], |body, p| {
                Ok(vec![body.neg(&p[0])?])
            })
            .unwrap();
        let err = Program::lower(tape.dispatch(), f.nodes(), &[], &[], false).unwrap_err();
        assert!(matches!(err, AdError::InvalidOperation(_)));

        let value = Arc::new(Tensor::zeros(&[2], DType::F64));
        let bound = [(f.params()[0].clone(), value)];
        assert!(Program::lower(tape.dispatch(), f.nodes(), &bound, &[], false).is_ok());
    }

    #[test]
    fn test_retain_pins_flagged_slots() {
        let mut tape = tape();
        let x = tape.leaf(Tensor::ones(&[2], DType::F64), true);
        let y = tape.exp(&x).unwrap();
        let z = tape.neg(&y).unwrap();
        let region = tape.close();

        let program = Program::lower(tape.dispatch(), region.nodes(), &[], &[], true).unwrap();
        // exp keeps its output, neg keeps nothing.
        assert!(program.slots[program.slot_of(ROOT_SCOPE, &y).unwrap()].pinned);
        assert!(!program.slots[program.slot_of(ROOT_SCOPE, &z).unwrap()].pinned);
    }
}
