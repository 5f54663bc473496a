use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::expr::{self, CallExpr, Expr};
use crate::interval::{DimBounds, Interval};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ScalarType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl ScalarType {
    pub fn bytes(self) -> i64 {
        match self {
            ScalarType::UInt8 | ScalarType::Int8 => 1,
            ScalarType::UInt16 | ScalarType::Int16 => 2,
            ScalarType::UInt32 | ScalarType::Int32 | ScalarType::Float32 => 4,
            ScalarType::Float64 => 8,
        }
    }
}

/// A reduction variable with its fixed iteration domain.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReductionVar {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
}

/// Argument of an opaque (extern) stage.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ExternArg {
    /// A whole pipeline function; the required region is unknown.
    Func(String),
    /// A scalar expression, possibly calling other functions.
    Expr(Expr),
    /// An input buffer of the given rank.
    Buffer { name: String, rank: usize },
}

/// One evaluation pass over a function's iteration space.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum StageDef {
    Init {
        values: Vec<Expr>,
    },
    Update {
        values: Vec<Expr>,
        args: Vec<Expr>,
        rdom: Vec<ReductionVar>,
    },
    Extern {
        args: Vec<ExternArg>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DimEstimate {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

/// An ordered list of stages sharing the same pure argument names. All
/// stages of a function are scheduled as one unit.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Function {
    pub name: String,
    pub args: Vec<String>,
    pub stages: Vec<StageDef>,
    pub value_types: Vec<ScalarType>,
    pub estimates: Vec<DimEstimate>,
}

/// A loop dimension of one stage, innermost first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dim {
    pub name: String,
    pub is_reduction: bool,
}

/// Identifies a stage: `stage` 0 is the initial definition, `stage` k > 0
/// the (k-1)-th update.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct StageRef {
    pub func: String,
    pub stage: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct InputBuffer {
    pub rank: usize,
    pub ty: ScalarType,
}

/// The environment the scheduler consumes: functions, outputs, opaque input
/// buffers, optional value-range estimates, and scalar parameter estimates.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Pipeline {
    pub env: BTreeMap<String, Function>,
    pub outputs: Vec<String>,
    pub inputs: BTreeMap<String, InputBuffer>,
    pub value_bounds: BTreeMap<String, Interval>,
    pub param_estimates: BTreeMap<String, Interval>,
}

impl Function {
    pub fn new(name: impl Into<String>, args: &[&str]) -> Function {
        Function {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stages: Vec::new(),
            value_types: vec![ScalarType::Float32],
            estimates: Vec::new(),
        }
    }

    /// Set the initial (pure) definition. Must be the first definition.
    pub fn define(mut self, value: Expr) -> Function {
        assert!(self.stages.is_empty(), "{}: already defined", self.name);
        self.stages.push(StageDef::Init {
            values: vec![value],
        });
        self
    }

    pub fn define_tuple(mut self, values: Vec<Expr>) -> Function {
        assert!(self.stages.is_empty(), "{}: already defined", self.name);
        self.value_types = vec![ScalarType::Float32; values.len()];
        self.stages.push(StageDef::Init { values });
        self
    }

    pub fn define_extern(mut self, args: Vec<ExternArg>) -> Function {
        assert!(self.stages.is_empty(), "{}: already defined", self.name);
        self.stages.push(StageDef::Extern { args });
        self
    }

    /// Append an update definition.
    pub fn update(mut self, args: Vec<Expr>, value: Expr, rdom: Vec<ReductionVar>) -> Function {
        assert!(!self.stages.is_empty(), "{}: update before init", self.name);
        self.stages.push(StageDef::Update {
            values: vec![value],
            args,
            rdom,
        });
        self
    }

    pub fn with_types(mut self, value_types: Vec<ScalarType>) -> Function {
        self.value_types = value_types;
        self
    }

    pub fn with_estimate(mut self, var: &str, min: i64, extent: i64) -> Function {
        self.estimates.push(DimEstimate {
            var: var.to_string(),
            min: expr::imm(min),
            extent: expr::imm(extent),
        });
        self
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn final_stage(&self) -> usize {
        self.stages.len() - 1
    }

    pub fn stage(&self, s: usize) -> &StageDef {
        &self.stages[s]
    }

    /// A pure function has only its initial, non-extern definition.
    pub fn is_pure(&self) -> bool {
        self.stages.len() == 1 && matches!(self.stages[0], StageDef::Init { .. })
    }

    pub fn has_extern_definition(&self) -> bool {
        matches!(self.stages[0], StageDef::Extern { .. })
    }

    pub fn bytes_per_point(&self) -> i64 {
        self.value_types.iter().map(|t| t.bytes()).sum()
    }

    /// The most recent estimate for a pure argument, if any.
    pub fn estimate_for(&self, var: &str) -> Option<&DimEstimate> {
        self.estimates.iter().rev().find(|e| e.var == var)
    }

    /// Loop dimensions of stage `s`, innermost first. Update stages iterate
    /// their reduction dimensions inside the pure dimensions of the
    /// left-hand side.
    pub fn stage_dims(&self, s: usize) -> Vec<Dim> {
        match &self.stages[s] {
            StageDef::Init { .. } | StageDef::Extern { .. } => self
                .args
                .iter()
                .map(|a| Dim {
                    name: a.clone(),
                    is_reduction: false,
                })
                .collect(),
            StageDef::Update { args, rdom, .. } => {
                let mut dims: Vec<Dim> = rdom
                    .iter()
                    .map(|r| Dim {
                        name: r.name.clone(),
                        is_reduction: true,
                    })
                    .collect();
                for a in args {
                    if let Expr::Var(v) = a {
                        if !dims.iter().any(|d| &d.name == v) {
                            dims.push(Dim {
                                name: v.clone(),
                                is_reduction: false,
                            });
                        }
                    }
                }
                dims
            }
        }
    }

    /// Left-hand side index expressions of stage `s`.
    pub fn stage_args(&self, s: usize) -> Vec<Expr> {
        match &self.stages[s] {
            StageDef::Init { .. } | StageDef::Extern { .. } => {
                self.args.iter().map(expr::var).collect()
            }
            StageDef::Update { args, .. } => args.clone(),
        }
    }

    pub fn stage_values(&self, s: usize) -> &[Expr] {
        match &self.stages[s] {
            StageDef::Init { values } | StageDef::Update { values, .. } => values,
            StageDef::Extern { .. } => &[],
        }
    }

    /// Bounds for every loop dimension of stage `s`, derived from bounds on
    /// the pure arguments. Reduction dimensions use their own domain.
    pub fn stage_bounds(&self, s: usize, pure_bounds: &DimBounds) -> DimBounds {
        let mut bounds = DimBounds::new();
        for d in self.stage_dims(s) {
            if d.is_reduction {
                let StageDef::Update { rdom, .. } = &self.stages[s] else {
                    unreachable!("reduction dim on non-update stage");
                };
                let r = rdom.iter().find(|r| r.name == d.name).unwrap();
                bounds.insert(
                    d.name,
                    Interval::new(
                        r.min.clone(),
                        (r.min.clone() + r.extent.clone() - expr::imm(1)).simplify(),
                    ),
                );
            } else {
                let b = pure_bounds
                    .get(&d.name)
                    .unwrap_or_else(|| panic!("{}: no bound for dim {}", self.name, d.name))
                    .clone();
                bounds.insert(d.name, b);
            }
        }
        bounds
    }

    /// Names of everything stage `s` reads: called functions and buffers.
    pub fn called_in_stage(&self, s: usize) -> BTreeSet<String> {
        fn walk(e: &Expr, called: &mut BTreeSet<String>) {
            for c in e.calls() {
                called.insert(c.callee.clone());
            }
        }
        let mut called = BTreeSet::new();
        match &self.stages[s] {
            StageDef::Init { values } => {
                values.iter().for_each(|v| walk(v, &mut called));
            }
            StageDef::Update { values, args, .. } => {
                values.iter().for_each(|v| walk(v, &mut called));
                args.iter().for_each(|a| walk(a, &mut called));
            }
            StageDef::Extern { args } => {
                for a in args {
                    match a {
                        ExternArg::Func(f) => {
                            called.insert(f.clone());
                        }
                        ExternArg::Expr(e) => walk(e, &mut called),
                        ExternArg::Buffer { name, .. } => {
                            called.insert(name.clone());
                        }
                    }
                }
            }
        }
        called
    }

    /// Every call site of stage `s`, including the store to the left-hand
    /// side itself, as `(callee, subscript expressions)`.
    pub fn stage_accesses(&self, s: usize) -> Vec<(String, Vec<Expr>)> {
        let mut accesses: Vec<(String, Vec<Expr>)> = Vec::new();
        let mut walk = |e: &Expr| {
            for c in e.calls() {
                accesses.push((c.callee.clone(), c.args.clone()));
            }
        };
        for v in self.stage_values(s) {
            walk(v);
        }
        for a in self.stage_args(s) {
            walk(&a);
        }
        accesses.push((self.name.clone(), self.stage_args(s)));
        accesses
    }
}

impl StageRef {
    pub fn new(func: impl Into<String>, stage: usize) -> StageRef {
        StageRef {
            func: func.into(),
            stage,
        }
    }
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stage == 0 {
            write!(f, "{}", self.func)
        } else {
            write!(f, "{}.update({})", self.func, self.stage - 1)
        }
    }
}

impl Pipeline {
    pub fn new(funcs: Vec<Function>, outputs: &[&str]) -> Pipeline {
        let env = funcs.into_iter().map(|f| (f.name.clone(), f)).collect();
        Pipeline {
            env,
            outputs: outputs.iter().map(|o| o.to_string()).collect(),
            inputs: BTreeMap::new(),
            value_bounds: BTreeMap::new(),
            param_estimates: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, name: &str, rank: usize, ty: ScalarType) -> Pipeline {
        self.inputs.insert(name.to_string(), InputBuffer { rank, ty });
        self
    }

    pub fn func(&self, name: &str) -> &Function {
        &self.env[name]
    }

    /// Deterministic topological order: every producer precedes its
    /// consumers, ties broken by name.
    pub fn realization_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        let mut visiting = BTreeSet::new();
        for out in &self.outputs {
            self.order_visit(out, &mut visited, &mut visiting, &mut order);
        }
        // Functions unreachable from the outputs still get a slot so that
        // handle indices are stable.
        for name in self.env.keys() {
            self.order_visit(name, &mut visited, &mut visiting, &mut order);
        }
        order
    }

    fn order_visit(
        &self,
        name: &str,
        visited: &mut BTreeSet<String>,
        visiting: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(name) || !self.env.contains_key(name) {
            return;
        }
        assert!(
            visiting.insert(name.to_string()),
            "cycle through function {}",
            name
        );
        let f = &self.env[name];
        for s in 0..f.num_stages() {
            for callee in f.called_in_stage(s) {
                if callee != name {
                    self.order_visit(&callee, visited, visiting, order);
                }
            }
        }
        visiting.remove(name);
        visited.insert(name.to_string());
        order.push(name.to_string());
    }
}

/// Whether distinct iterations of reduction dimension `rvar` may run in
/// parallel: some left-hand index must be exactly `rvar`, no other
/// left-hand index may mention it, and every read of the function itself
/// must match the write site.
pub fn can_parallelize_rvar(rvar: &str, func: &Function, stage: usize) -> bool {
    let StageDef::Update { values, args, .. } = func.stage(stage) else {
        return false;
    };
    let mut writes_rvar = false;
    for a in args {
        match a {
            Expr::Var(v) if v == rvar => writes_rvar = true,
            _ if a.uses_var(rvar) => return false,
            _ => {}
        }
    }
    if !writes_rvar {
        return false;
    }
    for v in values {
        for c in v.calls() {
            if c.callee == func.name && c.args != *args {
                return false;
            }
        }
    }
    true
}

/// Replace calls to inlined pure functions with their definitions, pure
/// arguments substituted by the call arguments. Chains of inlined functions
/// collapse fully.
pub fn inline_calls(
    e: &Expr,
    env: &BTreeMap<String, Function>,
    inlines: &BTreeSet<String>,
) -> Expr {
    e.transform(&mut |node| {
        let Expr::Call(CallExpr {
            callee,
            args,
            value_index,
        }) = node
        else {
            return None;
        };
        if !inlines.contains(callee) {
            return None;
        }
        let f = env.get(callee)?;
        if !f.is_pure() {
            return None;
        }
        let body = &f.stage_values(0)[*value_index];
        let mut substituted = body.clone();
        for (param, arg) in f.args.iter().zip(args) {
            let inlined_arg = inline_calls(arg, env, inlines);
            substituted = substituted.substitute(param, &inlined_arg);
        }
        Some(inline_calls(&substituted, env, inlines))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{call, imm, var};

    fn blur_pipeline() -> Pipeline {
        let f = Function::new("f", &["x", "y"])
            .define(var("x") + var("y"))
            .with_estimate("x", 0, 1024)
            .with_estimate("y", 0, 1024);
        let g = Function::new("g", &["x", "y"])
            .define(
                call("f", vec![var("x") - imm(1), var("y")])
                    + call("f", vec![var("x") + imm(1), var("y")]),
            )
            .with_estimate("x", 0, 1024)
            .with_estimate("y", 0, 1024);
        Pipeline::new(vec![f, g], &["g"])
    }

    fn histogram() -> Function {
        Function::new("h", &["x"]).define(imm(0)).update(
            vec![var("r")],
            call("h", vec![var("r")]) + call("in", vec![var("r")]),
            vec![ReductionVar {
                name: "r".to_string(),
                min: imm(0),
                extent: imm(100),
            }],
        )
    }

    #[test]
    fn stage_dims_put_reductions_innermost() {
        let h = histogram();
        let dims = h.stage_dims(1);
        assert_eq!(dims.len(), 2);
        assert_eq!(dims[0].name, "r");
        assert!(dims[0].is_reduction);
        assert_eq!(dims[1].name, "x");
        assert!(!dims[1].is_reduction);
    }

    #[test]
    fn update_stage_dims_skip_non_var_args() {
        let f = Function::new("f", &["x"]).define(imm(0)).update(
            vec![var("x") * imm(2)],
            imm(1),
            vec![],
        );
        assert!(f.stage_dims(1).is_empty());
    }

    #[test]
    fn stage_bounds_use_reduction_domains() {
        let h = histogram();
        let pure = DimBounds::from([("x".to_string(), Interval::new(imm(0), imm(9)))]);
        let bounds = h.stage_bounds(1, &pure);
        assert_eq!(bounds["r"], Interval::new(imm(0), imm(99)));
        assert_eq!(bounds["x"], Interval::new(imm(0), imm(9)));
    }

    #[test]
    fn realization_order_puts_producers_first() {
        let p = blur_pipeline();
        assert_eq!(p.realization_order(), vec!["f", "g"]);
    }

    #[test]
    fn called_in_stage_sees_update_reads() {
        let h = histogram();
        let called = h.called_in_stage(1);
        assert!(called.contains("h"));
        assert!(called.contains("in"));
    }

    #[test]
    fn parallelizable_when_lhs_is_the_rvar() {
        let h = histogram();
        assert!(can_parallelize_rvar("r", &h, 1));
    }

    #[test]
    fn not_parallelizable_when_iterations_collide() {
        // s(x) = 0; s(x) += in(r): every r writes the same site.
        let s = Function::new("s", &["x"]).define(imm(0)).update(
            vec![var("x")],
            call("s", vec![var("x")]) + call("in", vec![var("r")]),
            vec![ReductionVar {
                name: "r".to_string(),
                min: imm(0),
                extent: imm(100),
            }],
        );
        assert!(!can_parallelize_rvar("r", &s, 1));
    }

    #[test]
    fn not_parallelizable_when_reads_alias_other_iterations() {
        // scan(r) = scan(r - 1) + in(r)
        let scan = Function::new("scan", &["x"]).define(imm(0)).update(
            vec![var("r")],
            call("scan", vec![var("r") - imm(1)]) + call("in", vec![var("r")]),
            vec![ReductionVar {
                name: "r".to_string(),
                min: imm(1),
                extent: imm(99),
            }],
        );
        assert!(!can_parallelize_rvar("r", &scan, 1));
    }

    #[test]
    fn inlining_substitutes_through_chains() {
        let p = blur_pipeline();
        let inlines = BTreeSet::from(["f".to_string()]);
        let e = call("f", vec![var("u") + imm(1), var("v")]);
        let inlined = inline_calls(&e, &p.env, &inlines);
        assert_eq!(inlined.simplify(), (var("u") + imm(1)) + var("v"));
    }

    #[test]
    fn inlining_leaves_other_calls_alone() {
        let p = blur_pipeline();
        let inlines = BTreeSet::new();
        let e = call("f", vec![var("u")]);
        assert_eq!(inline_calls(&e, &p.env, &inlines), e);
    }
}
