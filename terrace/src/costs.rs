use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::expr::{self, Expr};
use crate::interval::{DimBounds, Region, RegionMap};
use crate::pipeline::{inline_calls, Pipeline, StageDef, StageRef};

/// Arithmetic and memory cost estimates. Either side is `None` when the
/// estimate could not be concluded symbolically.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Cost {
    pub arith: Option<Expr>,
    pub memory: Option<Expr>,
}

impl Cost {
    pub fn new(arith: Expr, memory: Expr) -> Cost {
        Cost {
            arith: Some(arith),
            memory: Some(memory),
        }
    }

    pub fn zero() -> Cost {
        Cost::new(expr::imm(0), expr::imm(0))
    }

    pub fn undefined() -> Cost {
        Cost {
            arith: None,
            memory: None,
        }
    }

    pub fn defined(&self) -> bool {
        self.arith.is_some() && self.memory.is_some()
    }

    pub fn simplify(&mut self) {
        self.arith = self.arith.as_ref().map(Expr::simplify);
        self.memory = self.memory.as_ref().map(Expr::simplify);
    }

    /// Componentwise sum; undefined sides poison the result.
    pub fn add(&self, other: &Cost) -> Cost {
        let join = |a: &Option<Expr>, b: &Option<Expr>| match (a, b) {
            (Some(a), Some(b)) => Some((a.clone() + b.clone()).simplify()),
            _ => None,
        };
        Cost {
            arith: join(&self.arith, &other.arith),
            memory: join(&self.memory, &other.memory),
        }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |e: &Option<Expr>| match e {
            Some(e) => e.to_string(),
            None => "undef".to_string(),
        };
        write!(f, "[arith: {}, memory: {}]", side(&self.arith), side(&self.memory))
    }
}

/// Per-point expression costs for every stage in the pipeline, and the
/// region aggregations the grouping analysis is built from.
pub struct RegionCosts<'p> {
    pub pipeline: &'p Pipeline,
}

impl<'p> RegionCosts<'p> {
    pub fn new(pipeline: &'p Pipeline) -> RegionCosts<'p> {
        RegionCosts { pipeline }
    }

    /// Cost of evaluating one point of `stage` after substituting the
    /// definitions of `inlined` functions: one operation per stored value
    /// plus the expression operations, and the bytes read by every call
    /// left after inlining.
    pub fn per_point_cost(&self, stage: &StageRef, inlined: &BTreeSet<String>) -> Cost {
        let f = self.pipeline.func(&stage.func);
        let mut arith = 0i64;
        let mut memory = 0i64;
        let mut exprs: Vec<&Expr> = Vec::new();
        match f.stage(stage.stage) {
            StageDef::Init { values } => {
                // One operation per stored value, plus the expressions.
                arith += values.len() as i64;
                exprs.extend(values.iter());
            }
            StageDef::Update { values, args, .. } => {
                arith += values.len() as i64;
                exprs.extend(values.iter());
                exprs.extend(args.iter());
            }
            StageDef::Extern { .. } => {
                // No visibility into the definition; charge one operation
                // per output value.
                arith += f.value_types.len() as i64;
            }
        }
        for e in exprs {
            let e = inline_calls(e, &self.pipeline.env, inlined);
            arith += e.op_count();
            for c in e.calls() {
                memory += self.element_bytes(&c.callee);
            }
        }
        Cost::new(expr::imm(arith), expr::imm(memory))
    }

    /// Bytes loaded per evaluated point, per load source.
    pub fn per_point_loads(
        &self,
        stage: &StageRef,
        inlined: &BTreeSet<String>,
    ) -> BTreeMap<String, i64> {
        let f = self.pipeline.func(&stage.func);
        let mut loads: BTreeMap<String, i64> = BTreeMap::new();
        let mut account = |e: &Expr| {
            let e = inline_calls(e, &self.pipeline.env, inlined);
            for c in e.calls() {
                *loads.entry(c.callee.clone()).or_insert(0) += self.element_bytes(&c.callee);
            }
        };
        match f.stage(stage.stage) {
            StageDef::Init { values } => values.iter().for_each(&mut account),
            StageDef::Update { values, args, .. } => {
                values.iter().for_each(&mut account);
                args.iter().for_each(&mut account);
            }
            StageDef::Extern { .. } => {}
        }
        loads
    }

    /// Number of points a stage evaluates to cover a region of the pure
    /// arguments, or `None` when any extent is unbounded.
    fn stage_iterations(&self, stage: &StageRef, region: &Region) -> Option<Expr> {
        let f = self.pipeline.func(&stage.func);
        debug_assert_eq!(region.len(), f.args.len());
        let pure_bounds: DimBounds = f
            .args
            .iter()
            .cloned()
            .zip(region.0.iter().cloned())
            .collect();
        let bounds = f.stage_bounds(stage.stage, &pure_bounds);
        let mut total = expr::imm(1);
        for (_, interval) in bounds {
            total = total * interval.extent()?;
        }
        Some(total.simplify())
    }

    /// Total cost of evaluating all stages of every function in `regions`
    /// over its region.
    pub fn region_cost(&self, regions: &RegionMap, inlined: &BTreeSet<String>) -> Cost {
        let mut total = Cost::zero();
        for (name, region) in regions {
            // Inlined functions are accounted inside their consumers.
            if inlined.contains(name) {
                continue;
            }
            let Some(f) = self.pipeline.env.get(name) else {
                continue;
            };
            for s in 0..f.num_stages() {
                let stage = StageRef::new(name.clone(), s);
                let Some(iterations) = self.stage_iterations(&stage, region) else {
                    return Cost::undefined();
                };
                let point = self.per_point_cost(&stage, inlined);
                let stage_cost = Cost {
                    arith: point.arith.map(|a| a * iterations.clone()),
                    memory: point.memory.map(|m| m * iterations.clone()),
                };
                total = total.add(&stage_cost);
            }
        }
        total.simplify();
        total
    }

    /// Cost of evaluating one stage over explicit loop bounds.
    pub fn stage_region_cost(
        &self,
        stage: &StageRef,
        bounds: &DimBounds,
        inlined: &BTreeSet<String>,
    ) -> Cost {
        let Some(iterations) = bounds_size(bounds) else {
            return Cost::undefined();
        };
        let point = self.per_point_cost(stage, inlined);
        let mut cost = Cost {
            arith: point.arith.map(|a| a * iterations.clone()),
            memory: point.memory.map(|m| m * iterations),
        };
        cost.simplify();
        cost
    }

    /// Bytes loaded from each source while evaluating every stage of every
    /// function in `regions` over its region. An unbounded region makes
    /// that source's load count `None`.
    pub fn detailed_load_costs(
        &self,
        regions: &RegionMap,
        inlined: &BTreeSet<String>,
    ) -> BTreeMap<String, Option<Expr>> {
        let mut totals: BTreeMap<String, Option<Expr>> = BTreeMap::new();
        for (name, region) in regions {
            if inlined.contains(name) {
                continue;
            }
            let Some(f) = self.pipeline.env.get(name) else {
                continue;
            };
            for s in 0..f.num_stages() {
                let stage = StageRef::new(name.clone(), s);
                let iterations = self.stage_iterations(&stage, region);
                for (source, bytes) in self.per_point_loads(&stage, inlined) {
                    let contribution = iterations
                        .as_ref()
                        .map(|i| (expr::imm(bytes) * i.clone()).simplify());
                    combine_load(&mut totals, &source, contribution);
                }
            }
        }
        totals
    }

    /// Like [RegionCosts::detailed_load_costs] for a single stage over
    /// explicit loop bounds.
    pub fn stage_detailed_load_costs(
        &self,
        stage: &StageRef,
        bounds: &DimBounds,
        inlined: &BTreeSet<String>,
    ) -> BTreeMap<String, Option<Expr>> {
        let iterations = bounds_size(bounds);
        let mut totals: BTreeMap<String, Option<Expr>> = BTreeMap::new();
        for (source, bytes) in self.per_point_loads(stage, inlined) {
            let contribution = iterations
                .as_ref()
                .map(|i| (expr::imm(bytes) * i.clone()).simplify());
            combine_load(&mut totals, &source, contribution);
        }
        totals
    }

    /// Bytes of storage for `region` of a pipeline function.
    pub fn region_size(&self, func: &str, region: &Region) -> Option<Expr> {
        let bytes = self.pipeline.env.get(func)?.bytes_per_point();
        Some((region.size()? * expr::imm(bytes)).simplify())
    }

    /// Bytes of storage for `region` of an input buffer.
    pub fn input_region_size(&self, input: &str, region: &Region) -> Option<Expr> {
        let bytes = self
            .pipeline
            .inputs
            .get(input)
            .map(|i| i.ty.bytes())
            .unwrap_or(4);
        Some((region.size()? * expr::imm(bytes)).simplify())
    }

    fn element_bytes(&self, name: &str) -> i64 {
        if let Some(f) = self.pipeline.env.get(name) {
            f.bytes_per_point()
        } else if let Some(input) = self.pipeline.inputs.get(name) {
            input.ty.bytes()
        } else {
            4
        }
    }
}

fn bounds_size(bounds: &DimBounds) -> Option<Expr> {
    let mut total = expr::imm(1);
    for interval in bounds.values() {
        total = total * interval.extent()?;
    }
    Some(total.simplify())
}

/// Sum `contribution` into the per-source load totals; `None` poisons the
/// entry.
pub fn combine_load(
    totals: &mut BTreeMap<String, Option<Expr>>,
    source: &str,
    contribution: Option<Expr>,
) {
    match totals.get_mut(source) {
        None => {
            totals.insert(source.to_string(), contribution);
        }
        Some(slot) => {
            *slot = match (slot.take(), contribution) {
                (Some(a), Some(b)) => Some((a + b).simplify()),
                _ => None,
            };
        }
    }
}

/// Merge two per-source load maps.
pub fn combine_load_costs(
    totals: &mut BTreeMap<String, Option<Expr>>,
    partial: BTreeMap<String, Option<Expr>>,
) {
    for (source, contribution) in partial {
        combine_load(totals, &source, contribution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{call, imm, var};
    use crate::interval::Interval;
    use crate::pipeline::{Function, Pipeline, ReductionVar, ScalarType};

    fn iv(lo: i64, hi: i64) -> Interval {
        Interval::new(imm(lo), imm(hi))
    }

    fn simple_pipeline() -> Pipeline {
        let f = Function::new("f", &["x", "y"]).define(var("x") + var("y"));
        let g = Function::new("g", &["x", "y"])
            .define(
                call("f", vec![var("x"), var("y")]) + call("f", vec![var("x") + imm(1), var("y")]),
            )
            .with_estimate("x", 0, 512)
            .with_estimate("y", 0, 512);
        Pipeline::new(vec![f, g], &["g"])
    }

    #[test]
    fn per_point_cost_counts_ops_and_loads() {
        let p = simple_pipeline();
        let costs = RegionCosts::new(&p);
        let c = costs.per_point_cost(&StageRef::new("g", 0), &BTreeSet::new());
        // One store, one add, two float loads of 4 bytes.
        assert_eq!(c.arith, Some(imm(3)));
        assert_eq!(c.memory, Some(imm(8)));
    }

    #[test]
    fn inlining_removes_loads_and_adds_ops() {
        let p = simple_pipeline();
        let costs = RegionCosts::new(&p);
        let inlined = BTreeSet::from(["f".to_string()]);
        let c = costs.per_point_cost(&StageRef::new("g", 0), &inlined);
        assert_eq!(c.memory, Some(imm(0)));
        // (x + y) + ((x + 1) + y) + the outer add + the store.
        assert_eq!(c.arith, Some(imm(5)));
    }

    #[test]
    fn region_cost_scales_with_region() {
        let p = simple_pipeline();
        let costs = RegionCosts::new(&p);
        let regions = RegionMap::from([(
            "f".to_string(),
            [iv(0, 63), iv(0, 63)].into_iter().collect::<Region>(),
        )]);
        let c = costs.region_cost(&regions, &BTreeSet::new());
        // f costs 2 ops per point over 64x64 points.
        assert_eq!(c.arith, Some(imm(2 * 64 * 64)));
        assert_eq!(c.memory, Some(imm(0)));
    }

    #[test]
    fn region_cost_undefined_on_unbounded_region() {
        let p = simple_pipeline();
        let costs = RegionCosts::new(&p);
        let regions = RegionMap::from([(
            "f".to_string(),
            [iv(0, 63), Interval::everything()].into_iter().collect::<Region>(),
        )]);
        assert!(!costs.region_cost(&regions, &BTreeSet::new()).defined());
    }

    #[test]
    fn update_stages_iterate_their_reduction_domain() {
        let h = Function::new("h", &["x"])
            .define(imm(0))
            .update(
                vec![var("x")],
                call("h", vec![var("x")]) + call("in", vec![var("r"), var("x")]),
                vec![ReductionVar {
                    name: "r".to_string(),
                    min: imm(0),
                    extent: imm(10),
                }],
            )
            .with_estimate("x", 0, 16);
        let p = Pipeline::new(vec![h], &["h"]).with_input("in", 2, ScalarType::Float32);
        let costs = RegionCosts::new(&p);
        let regions = RegionMap::from([("h".to_string(), [iv(0, 15)].into_iter().collect::<Region>())]);
        let c = costs.region_cost(&regions, &BTreeSet::new());
        // Init: 1 op x 16 points. Update: 2 ops x 16 x 10 points.
        assert_eq!(c.arith, Some(imm(16 + 2 * 160)));
    }

    #[test]
    fn detailed_loads_attribute_bytes_per_source() {
        let p = simple_pipeline();
        let costs = RegionCosts::new(&p);
        let regions = RegionMap::from([(
            "g".to_string(),
            [iv(0, 31), iv(0, 31)].into_iter().collect::<Region>(),
        )]);
        let loads = costs.detailed_load_costs(&regions, &BTreeSet::new());
        assert_eq!(loads["f"], Some(imm(8 * 32 * 32)));
    }

    #[test]
    fn region_sizes_count_bytes() {
        let p = simple_pipeline();
        let costs = RegionCosts::new(&p);
        let region: Region = [iv(0, 9), iv(0, 9)].into_iter().collect::<Region>();
        assert_eq!(costs.region_size("f", &region), Some(imm(400)));
    }

    #[test]
    fn load_combination_poisons_on_undefined() {
        let mut totals = BTreeMap::from([("a".to_string(), Some(imm(4)))]);
        combine_load(&mut totals, "a", Some(imm(6)));
        assert_eq!(totals["a"], Some(imm(10)));
        combine_load(&mut totals, "a", None);
        assert_eq!(totals["a"], None);
    }
}
