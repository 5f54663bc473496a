use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::expr::{self, Expr};
use crate::interval::Region;
use crate::machine::Target;
use crate::partitioner::{Group, Partitioner};
use crate::pipeline::{can_parallelize_rvar, StageRef};

/// Replace all non-alphanumeric characters so the name is a valid
/// identifier in the rendered schedule.
pub fn sanitized_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ForType {
    Serial,
    Vectorized,
    Parallel,
}

#[derive(Clone, Debug)]
struct LoopDim {
    name: String,
    is_rvar: bool,
    for_type: ForType,
}

/// The loop nest of one stage as the directives reshape it, innermost
/// first.
#[derive(Clone, Debug)]
struct LoopNest {
    dims: Vec<LoopDim>,
}

impl LoopNest {
    fn position(&self, name: &str) -> usize {
        self.dims
            .iter()
            .position(|d| d.name == name)
            .unwrap_or_else(|| panic!("no loop dimension named {}", name))
    }

    /// Replace `name` with the inner piece at its position and the outer
    /// piece just outside it.
    fn split(&mut self, name: &str, inner: &str, outer: &str) {
        let pos = self.position(name);
        let is_rvar = self.dims[pos].is_rvar;
        self.dims[pos] = LoopDim {
            name: inner.to_string(),
            is_rvar,
            for_type: ForType::Serial,
        };
        self.dims.insert(
            pos + 1,
            LoopDim {
                name: outer.to_string(),
                is_rvar,
                for_type: ForType::Serial,
            },
        );
    }

    /// Permute the named dims into the given order (innermost first),
    /// keeping the positions occupied by the set.
    fn reorder(&mut self, order: &[String]) {
        let mut slots: Vec<usize> = order.iter().map(|n| self.position(n)).collect();
        slots.sort_unstable();
        let reordered: Vec<LoopDim> = order
            .iter()
            .map(|n| self.dims[self.position(n)].clone())
            .collect();
        for (slot, dim) in slots.into_iter().zip(reordered) {
            self.dims[slot] = dim;
        }
    }

    /// True when the nest order differs from `order` over all dims.
    fn differs_from(&self, order: &[String]) -> bool {
        if self.dims.len() != order.len() {
            return true;
        }
        self.dims.iter().zip(order).any(|(d, n)| &d.name != n)
    }

    fn set_for_type(&mut self, name: &str, for_type: ForType) {
        let pos = self.position(name);
        self.dims[pos].for_type = for_type;
    }
}

/// Accumulates the textual schedule: declared loop variables and the
/// directive list applied to each function stage.
pub struct Schedule {
    /// Realization order of the full pipeline, for function handles.
    handle_order: Vec<String>,
    /// Pure argument names per function, for the block declarations.
    func_args: BTreeMap<String, Vec<String>>,
    /// Reduction variable names per function, declared as RVars when used.
    func_rvars: BTreeMap<String, BTreeSet<String>>,
    /// Variables introduced by splits, with their reduction-ness.
    internal_vars: BTreeMap<String, bool>,
    /// Directives per function, per stage, in application order.
    func_schedules: BTreeMap<String, BTreeMap<usize, Vec<String>>>,
    /// Variables referenced by the directives of each function stage.
    used_vars: BTreeMap<String, BTreeMap<usize, BTreeSet<String>>>,
}

impl Schedule {
    fn new(
        handle_order: Vec<String>,
        func_args: BTreeMap<String, Vec<String>>,
        func_rvars: BTreeMap<String, BTreeSet<String>>,
    ) -> Schedule {
        Schedule {
            handle_order,
            func_args,
            func_rvars,
            internal_vars: BTreeMap::new(),
            func_schedules: BTreeMap::new(),
            used_vars: BTreeMap::new(),
        }
    }

    fn declare_internal_var(&mut self, name: &str, is_rvar: bool) {
        match self.internal_vars.get(name) {
            Some(existing) => assert_eq!(
                *existing, is_rvar,
                "variable {} redeclared with a different kind",
                name
            ),
            None => {
                self.internal_vars.insert(name.to_string(), is_rvar);
            }
        }
    }

    /// Append a directive to a stage, suppressing immediate duplicates.
    fn push(&mut self, func: &str, stage: usize, directive: String, vars: &[&str]) {
        self.used_vars
            .entry(func.to_string())
            .or_default()
            .entry(stage)
            .or_default()
            .extend(vars.iter().map(|v| v.to_string()));
        let directives = self
            .func_schedules
            .entry(func.to_string())
            .or_default()
            .entry(stage)
            .or_default();
        if directives.last() != Some(&directive) {
            directives.push(directive);
        }
    }

    fn handle_index(&self, func: &str) -> usize {
        self.handle_order
            .iter()
            .position(|f| f == func)
            .unwrap_or_else(|| panic!("{} not in realization order", func))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, is_rvar) in &self.internal_vars {
            let kind = if *is_rvar { "RVar" } else { "Var" };
            writeln!(f, "{} {}(\"{}\");", kind, name, name)?;
        }
        writeln!(f)?;

        for func in self.func_schedules.keys() {
            writeln!(
                f,
                "Func {} = pipeline.get_func({});",
                sanitized_name(func),
                self.handle_index(func)
            )?;
        }
        writeln!(f)?;

        for (func, stages) in &self.func_schedules {
            let fname = sanitized_name(func);
            writeln!(f, "{{")?;
            let empty = BTreeMap::new();
            let used = self.used_vars.get(func).unwrap_or(&empty);
            let args = self.func_args.get(func);
            let mut declared: BTreeSet<&String> = BTreeSet::new();
            for vars in used.values() {
                for v in vars {
                    if self.internal_vars.contains_key(v) || !declared.insert(v) {
                        continue;
                    }
                    let arg_index =
                        args.and_then(|args| args.iter().position(|a| a == v));
                    if let Some(i) = arg_index {
                        writeln!(f, "    Var {} = {}.args()[{}];", v, fname, i)?;
                    } else if self
                        .func_rvars
                        .get(func)
                        .is_some_and(|rvars| rvars.contains(v))
                    {
                        writeln!(f, "    RVar {}(\"{}\");", v, v)?;
                    }
                }
            }
            for (stage, directives) in stages {
                assert!(!directives.is_empty(), "empty schedule for {}", fname);
                write!(f, "    {}", fname)?;
                if *stage > 0 {
                    write!(f, ".update({})", stage - 1)?;
                }
                for d in directives {
                    write!(f, "\n        .{}", d)?;
                }
                writeln!(f, ";")?;
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

/// Walks the final grouping and produces the schedule directives for every
/// group, subgroup and member.
pub struct Emitter<'a, 'b, 'p> {
    part: &'a Partitioner<'b, 'p>,
    target: &'a Target,
    loop_bounds: BTreeMap<StageRef, BTreeMap<StageRef, crate::interval::DimBounds>>,
    storage_bounds: BTreeMap<StageRef, BTreeMap<String, Region>>,
    inlines: BTreeSet<String>,
    sched: Schedule,
}

impl<'a, 'b, 'p> Emitter<'a, 'b, 'p> {
    pub fn generate(part: &'a Partitioner<'b, 'p>, target: &'a Target) -> Schedule {
        // Bounds are grabbed up front; they depend on the grouping alone.
        let loop_bounds = part.group_loop_bounds();
        let storage_bounds = part.group_storage_bounds();

        let mut inlines = BTreeSet::new();
        for g in part.groups.values() {
            inlines.extend(g.inlined.iter().cloned());
        }

        let pipeline = part.dependence().pipeline;
        let mut func_args = BTreeMap::new();
        let mut func_rvars: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, f) in &pipeline.env {
            func_args.insert(name.clone(), f.args.clone());
            let rvars = func_rvars.entry(name.clone()).or_default();
            for s in 0..f.num_stages() {
                for d in f.stage_dims(s) {
                    if d.is_reduction {
                        rvars.insert(d.name);
                    }
                }
            }
        }

        let mut emitter = Emitter {
            part,
            target,
            loop_bounds,
            storage_bounds,
            inlines,
            sched: Schedule::new(pipeline.realization_order(), func_args, func_rvars),
        };

        let groups: Vec<(StageRef, Group)> = part
            .groups
            .iter()
            .map(|(k, g)| (k.clone(), g.clone()))
            .collect();
        for (key, group) in groups {
            emitter.schedule_group(&key, &group);
        }
        emitter.sched
    }

    fn pipeline(&self) -> &'p crate::pipeline::Pipeline {
        self.part.dependence().pipeline
    }

    fn nest_for(&self, stage: &StageRef) -> (LoopNest, BTreeSet<String>) {
        let f = self.pipeline().func(&stage.func);
        let mut rvars = BTreeSet::new();
        let dims = f
            .stage_dims(stage.stage)
            .into_iter()
            .map(|d| {
                if d.is_reduction {
                    rvars.insert(d.name.clone());
                }
                LoopDim {
                    name: d.name,
                    is_rvar: d.is_reduction,
                    for_type: ForType::Serial,
                }
            })
            .collect();
        (LoopNest { dims }, rvars)
    }

    fn schedule_group(&mut self, key: &StageRef, g: &Group) {
        let out_func = g.output.func.clone();
        let out_f = self.pipeline().func(&out_func);

        if g.output.stage == 0 {
            self.sched
                .push(&out_func, 0, "compute_root()".to_string(), &[]);
        }

        if out_f.has_extern_definition() {
            debug_assert_eq!(g.members.len(), 1);
            return;
        }

        let (mut nest, mut rvars) = self.nest_for(&g.output);
        let stg_bounds = self.part.get_bounds(&g.output);
        let mut stg_estimates = self.part.bounds_to_estimates(&stg_bounds);

        // Smallest access stride innermost.
        if nest.dims.len() > 1 {
            let strides = self.part.analyze_spatial_locality(
                &g.output,
                &self.storage_bounds[key],
                &self.inlines,
            );
            if !strides.is_empty() {
                self.reorder_dims(&g.output, &mut nest, strides);
            }
        }

        let dim_vars: Vec<String> = nest.dims.iter().map(|d| d.name.clone()).collect();

        // Outer tile factor per dimension, plus the sub-tile factor when the
        // recursive refinement chose one for the output itself.
        let mut out_tiles: BTreeMap<String, Vec<Expr>> = BTreeMap::new();
        for (var, size) in &g.tile_sizes {
            out_tiles.entry(var.clone()).or_default().push(size.clone());
        }
        for sub in &g.subgroups {
            if sub.output == g.output {
                for (var, size) in &sub.tile_sizes {
                    debug_assert!(out_tiles.contains_key(var));
                    out_tiles.entry(var.clone()).or_default().push(size.clone());
                }
            }
        }

        let mut inner_dims: Vec<String> = Vec::new();
        let mut outer_dims: Vec<String> = Vec::new();
        let mut tile_inner_var = String::new();

        for var in &dim_vars {
            let is_rvar = rvars.contains(var);
            let sizes = out_tiles.get(var).cloned().unwrap_or_default();
            debug_assert!(out_tiles.get(var).is_none() || !sizes.is_empty());
            let estimate_allows = matches!(
                stg_estimates.get(var),
                Some(Some(est)) if !sizes.is_empty() && expr::can_prove_gt(est, &sizes[0])
            );
            if !estimate_allows {
                inner_dims.push(var.clone());
                continue;
            }

            let tile_size = sizes[0].clone();
            if expr::can_prove_eq(&tile_size, &expr::imm(1)) {
                outer_dims.push(var.clone());
                if tile_inner_var.is_empty() {
                    tile_inner_var = var.clone();
                }
                continue;
            }

            let (tile_inner, tile_outer) = self.split_dim(
                g,
                &g.output,
                true,
                &mut nest,
                var,
                &tile_size,
                "_i",
                "_o",
                &mut stg_estimates,
            );

            let mut split_subtile = false;
            if sizes.len() > 1 {
                let subtile_size = sizes[1].clone();
                if !expr::can_prove_eq(&subtile_size, &expr::imm(1)) {
                    let (sub_inner, sub_outer) = self.split_dim(
                        g,
                        &g.output,
                        true,
                        &mut nest,
                        &tile_inner,
                        &subtile_size,
                        "_i",
                        "_o",
                        &mut stg_estimates,
                    );
                    split_subtile = true;
                    inner_dims.push(sub_inner.clone());
                    outer_dims.push(sub_outer.clone());
                    outer_dims.push(tile_outer.clone());
                    if is_rvar {
                        rvars.remove(var);
                        rvars.insert(sub_inner);
                        rvars.insert(sub_outer.clone());
                        rvars.insert(tile_outer.clone());
                    }
                    if tile_inner_var.is_empty() {
                        tile_inner_var = sub_outer;
                    }
                }
            }

            if !split_subtile {
                inner_dims.push(tile_inner.clone());
                outer_dims.push(tile_outer.clone());
                if is_rvar {
                    rvars.remove(var);
                    rvars.insert(tile_inner);
                    rvars.insert(tile_outer.clone());
                }
                if tile_inner_var.is_empty() {
                    tile_inner_var = tile_outer;
                }
            }
        }

        // All inner pieces precede all outer pieces.
        if !outer_dims.is_empty() {
            let ordering: Vec<String> = inner_dims
                .iter()
                .chain(outer_dims.iter())
                .cloned()
                .collect();
            self.push_reorder(&g.output, &mut nest, &ordering);
        }

        self.vectorize_stage(g, &g.output, true, &mut nest, &mut rvars, &mut stg_estimates);

        // From the outside in, parallelize until the machine is saturated,
        // pushing stubbornly serial reduction loops inward.
        let mut def_par = expr::imm(1);
        let mut seq_var = String::new();
        for d in (0..nest.dims.len()).rev() {
            if nest.dims[d].for_type == ForType::Vectorized {
                break;
            }
            let var = nest.dims[d].name.clone();
            let is_rvar = nest.dims[d].is_rvar;

            if is_rvar && !self.rvar_piece_parallelizable(&var, &g.output) {
                if seq_var.is_empty() {
                    seq_var = var;
                }
                continue;
            }

            if expr::can_prove_ge(&def_par, &expr::imm(self.part.machine_params().parallelism)) {
                break;
            }

            let Some(Some(estimate)) = stg_estimates.get(&var).cloned() else {
                break;
            };
            if !seq_var.is_empty() {
                let swap = vec![seq_var.clone(), var.clone()];
                nest.reorder(&swap);
                self.sched.push(
                    &out_func,
                    g.output.stage,
                    format!("reorder({}, {})", seq_var, var),
                    &[&seq_var, &var],
                );
            }
            nest.set_for_type(&var, ForType::Parallel);
            self.sched.push(
                &out_func,
                g.output.stage,
                format!("parallel({})", var),
                &[&var],
            );
            def_par = (def_par * estimate).simplify();
        }

        if !expr::can_prove_ge(&def_par, &expr::imm(self.part.machine_params().parallelism)) {
            warn!("insufficient parallelism for {}", out_func);
        }

        for sub in &g.subgroups {
            let mut subtile_inner_var = String::new();

            if sub.output.func != out_func {
                self.schedule_subgroup_output(
                    g,
                    sub,
                    &outer_dims,
                    &tile_inner_var,
                    &mut subtile_inner_var,
                );
            } else if !outer_dims.is_empty() && nest.dims.len() > outer_dims.len() {
                let tile_inner_index = nest.dims.len() - outer_dims.len() - 1;
                subtile_inner_var = nest.dims[tile_inner_index].name.clone();
            }

            for member in &sub.members {
                if g.inlined.contains(&member.func)
                    || member.func == out_func
                    || member.func == sub.output.func
                {
                    continue;
                }
                self.schedule_member(key, g, sub, member, &tile_inner_var, &subtile_inner_var);
            }
        }
    }

    /// Tile, place and vectorize the output of a subgroup inside the
    /// enclosing group's tile loop.
    fn schedule_subgroup_output(
        &mut self,
        g: &Group,
        sub: &Group,
        outer_dims: &[String],
        tile_inner_var: &str,
        subtile_inner_var: &mut String,
    ) {
        let sub_func = sub.output.func.clone();
        if self.pipeline().func(&sub_func).has_extern_definition() {
            return;
        }
        let (mut nest, mut rvars) = self.nest_for(&sub.output);

        let group_key = &g.output;
        let sub_bounds = self
            .loop_bounds
            .get(group_key)
            .and_then(|b| b.get(&sub.output))
            .cloned();
        let mut sub_estimates = match sub_bounds {
            Some(bounds) => self.part.bounds_to_estimates(&bounds),
            None => self
                .part
                .bounds_to_estimates(&self.part.get_bounds(&sub.output)),
        };

        if nest.dims.len() > 1 {
            let strides = self.part.analyze_spatial_locality(
                &sub.output,
                &self.storage_bounds[group_key],
                &self.inlines,
            );
            if !strides.is_empty() {
                self.reorder_dims(&sub.output, &mut nest, strides);
            }
        }

        let sub_dim_vars: Vec<String> = nest.dims.iter().map(|d| d.name.clone()).collect();
        let mut sub_inner: Vec<String> = Vec::new();
        let mut sub_outer: Vec<String> = Vec::new();

        for var in &sub_dim_vars {
            let is_rvar = rvars.contains(var);
            let tiled = sub.tile_sizes.get(var).filter(|size| {
                matches!(
                    sub_estimates.get(var),
                    Some(Some(est)) if expr::can_prove_gt(est, size)
                )
            });
            let Some(size) = tiled.cloned() else {
                sub_inner.push(var.clone());
                continue;
            };

            if expr::can_prove_eq(&size, &expr::imm(1)) {
                sub_outer.push(var.clone());
                if subtile_inner_var.is_empty() {
                    *subtile_inner_var = var.clone();
                }
                continue;
            }

            let (inner, outer) = self.split_dim(
                sub,
                &sub.output,
                true,
                &mut nest,
                var,
                &size,
                "_i",
                "_o",
                &mut sub_estimates,
            );
            sub_inner.push(inner.clone());
            sub_outer.push(outer.clone());
            if is_rvar {
                rvars.remove(var);
                rvars.insert(inner);
                rvars.insert(outer.clone());
            }
            if subtile_inner_var.is_empty() {
                *subtile_inner_var = outer;
            }
        }

        if !sub_outer.is_empty() {
            let ordering: Vec<String> =
                sub_inner.iter().chain(sub_outer.iter()).cloned().collect();
            self.push_reorder(&sub.output, &mut nest, &ordering);
        }

        if !outer_dims.is_empty() {
            let host = sanitized_name(&g.output.func);
            self.sched.push(
                &sub_func,
                sub.output.stage,
                format!("compute_at({}, {})", host, tile_inner_var),
                &[host.as_str(), tile_inner_var],
            );
        } else {
            warn!("degenerate tiling, no dimensions are tiled");
            warn!("computing {} at root", sub_func);
            self.sched
                .push(&sub_func, sub.output.stage, "compute_root()".to_string(), &[]);
        }

        self.vectorize_stage(sub, &sub.output, false, &mut nest, &mut rvars, &mut sub_estimates);
    }

    /// Place a non-output member: storage at the group tile, computation at
    /// the sub-tile, locality reorder and vectorization.
    fn schedule_member(
        &mut self,
        key: &StageRef,
        g: &Group,
        sub: &Group,
        member: &StageRef,
        tile_inner_var: &str,
        subtile_inner_var: &str,
    ) {
        if self.pipeline().func(&member.func).has_extern_definition() {
            return;
        }
        let (mut nest, mut rvars) = self.nest_for(member);
        let mut mem_estimates = match self
            .loop_bounds
            .get(key)
            .and_then(|b| b.get(member))
            .cloned()
        {
            Some(bounds) => self.part.bounds_to_estimates(&bounds),
            None => self
                .part
                .bounds_to_estimates(&self.part.get_bounds(member)),
        };

        if member.stage == 0 {
            let mut placed = false;
            if !tile_inner_var.is_empty() {
                let host = sanitized_name(&g.output.func);
                self.sched.push(
                    &member.func,
                    member.stage,
                    format!("store_at({}, {})", host, tile_inner_var),
                    &[host.as_str(), tile_inner_var],
                );
                placed = true;
            }
            if !subtile_inner_var.is_empty() {
                let host = sanitized_name(&sub.output.func);
                self.sched.push(
                    &member.func,
                    member.stage,
                    format!("compute_at({}, {})", host, subtile_inner_var),
                    &[host.as_str(), subtile_inner_var],
                );
                placed = true;
            }
            if !placed {
                warn!("degenerate tiling, no dimensions are tiled");
                warn!("computing {} at root", member.func);
                self.sched
                    .push(&member.func, member.stage, "compute_root()".to_string(), &[]);
            }
        }

        if nest.dims.len() > 1 {
            let strides = self.part.analyze_spatial_locality(
                member,
                &self.storage_bounds[key],
                &self.inlines,
            );
            if !strides.is_empty() {
                self.reorder_dims(member, &mut nest, strides);
            }
        }

        self.vectorize_stage(sub, member, false, &mut nest, &mut rvars, &mut mem_estimates);
    }

    /// Split `var` by `factor`, register the new loop variables, and track
    /// the extent estimates of the pieces.
    #[allow(clippy::too_many_arguments)]
    fn split_dim(
        &mut self,
        g: &Group,
        stage: &StageRef,
        is_group_output: bool,
        nest: &mut LoopNest,
        var: &str,
        factor: &Expr,
        in_suffix: &str,
        out_suffix: &str,
        estimates: &mut BTreeMap<String, Option<Expr>>,
    ) -> (String, String) {
        let inner = format!("{}{}", var, in_suffix);
        let outer = format!("{}{}", var, out_suffix);
        let is_rvar = nest.dims[nest.position(var)].is_rvar;
        self.sched.declare_internal_var(&inner, is_rvar);
        self.sched.declare_internal_var(&outer, is_rvar);

        // Splitting a pure dimension of an update must not write out of
        // bounds when the stage touches pipeline inputs or outputs; guard
        // the tail in that case.
        let mut strategy = "";
        if stage.stage > 0 && !is_rvar {
            let guard = if is_group_output {
                g.members.iter().any(|m| {
                    m.func != stage.func && self.accesses_inputs_or_outputs(m, var)
                })
            } else {
                self.accesses_inputs_or_outputs(stage, var)
            };
            if guard {
                strategy = ", TailStrategy::GuardWithIf";
            }
        }

        nest.split(var, &inner, &outer);
        self.sched.push(
            &stage.func,
            stage.stage,
            format!("split({}, {}, {}, {}{})", var, outer, inner, factor, strategy),
            &[var, &outer, &inner],
        );

        let est = estimates
            .get(var)
            .cloned()
            .unwrap_or_else(|| panic!("no estimate for {} while splitting", var));
        estimates.insert(inner.clone(), Some(factor.clone()));
        estimates.insert(
            outer.clone(),
            est.map(|e| expr::ceil_div(e, factor.clone()).simplify()),
        );
        estimates.remove(var);

        (inner, outer)
    }

    /// True when any access to a pipeline input or output in the stage
    /// subscripts by `var`.
    fn accesses_inputs_or_outputs(&self, stage: &StageRef, var: &str) -> bool {
        let pipeline = self.pipeline();
        let f = pipeline.func(&stage.func);
        for (callee, args) in f.stage_accesses(stage.stage) {
            let is_input = pipeline.inputs.contains_key(&callee)
                || !pipeline.env.contains_key(&callee);
            let is_output = self.part.outputs().contains(&callee);
            if !is_input && !is_output {
                continue;
            }
            if args.iter().any(|a| a.uses_var(var)) {
                return true;
            }
        }
        false
    }

    /// Split and mark the first dimension, innermost out, that is wide
    /// enough for the target's vectors and safe to reorder lanes over.
    fn vectorize_stage(
        &mut self,
        g: &Group,
        stage: &StageRef,
        is_group_output: bool,
        nest: &mut LoopNest,
        rvars: &mut BTreeSet<String>,
        estimates: &mut BTreeMap<String, Option<Expr>>,
    ) {
        let f = self.pipeline().func(&stage.func);
        let vec_len = f
            .value_types
            .iter()
            .map(|t| self.target.natural_vector_size(*t))
            .max()
            .unwrap_or(0);
        if vec_len == 0 {
            return;
        }
        let vec_len_expr = expr::imm(vec_len);

        let mut vec_dim_index = None;
        for (d, dim) in nest.dims.iter().enumerate() {
            let can_vectorize = if rvars.contains(&dim.name) {
                self.rvar_piece_parallelizable(&dim.name, stage)
            } else {
                true
            };
            if !can_vectorize {
                continue;
            }
            if let Some(Some(est)) = estimates.get(&dim.name) {
                if expr::can_prove_ge(est, &vec_len_expr) {
                    vec_dim_index = Some(d);
                    break;
                }
            }
        }

        let Some(index) = vec_dim_index else {
            return;
        };
        let vec_dim_name = nest.dims[index].name.clone();
        let is_rvar = rvars.contains(&vec_dim_name);

        let (inner, outer) = self.split_dim(
            g,
            stage,
            is_group_output,
            nest,
            &vec_dim_name,
            &vec_len_expr,
            "_vi",
            "_vo",
            estimates,
        );
        nest.set_for_type(&inner, ForType::Vectorized);
        self.sched.push(
            &stage.func,
            stage.stage,
            format!("vectorize({})", inner),
            &[inner.as_str()],
        );
        if is_rvar {
            rvars.remove(&vec_dim_name);
            rvars.insert(inner);
            rvars.insert(outer);
        }
        if index > 0 {
            warn!(
                "outer dim vectorization of var {} in function {}",
                vec_dim_name, stage.func
            );
        }
    }

    /// Whether a (possibly split) reduction variable may have its
    /// iterations reordered, by checking the base reduction dimension.
    fn rvar_piece_parallelizable(&self, var: &str, stage: &StageRef) -> bool {
        let f = self.pipeline().func(&stage.func);
        let base = f
            .stage_dims(stage.stage)
            .into_iter()
            .filter(|d| d.is_reduction)
            .map(|d| d.name)
            .find(|name| var == name.as_str() || var.starts_with(&format!("{}_", name)));
        match base {
            Some(base) => can_parallelize_rvar(&base, f, stage.stage),
            None => false,
        }
    }

    /// Order the dims ascending by access stride, reduction dims kept in
    /// their relative order, then emit a reorder when anything moved.
    fn reorder_dims(
        &mut self,
        stage: &StageRef,
        nest: &mut LoopNest,
        mut strides: BTreeMap<String, Expr>,
    ) {
        debug_assert!(nest.dims.iter().all(|d| strides.contains_key(&d.name)));
        let int_max = expr::imm(i64::MAX);
        let mut order: Vec<String> = Vec::new();

        while !strides.is_empty() {
            let mut found_pure = false;
            let mut min_pure_stride = int_max.clone();
            let mut min_pure_var = String::new();
            for dim in &nest.dims {
                let Some(stride) = strides.get(&dim.name) else {
                    continue;
                };
                if dim.is_rvar {
                    continue;
                }
                if expr::can_prove_lt(stride, &min_pure_stride) {
                    min_pure_stride = stride.clone();
                    min_pure_var = dim.name.clone();
                }
                found_pure = true;
            }
            if found_pure && min_pure_var.is_empty() {
                // No provable minimum; bail out rather than loop forever.
                return;
            }

            let mut min_impure_stride = int_max.clone();
            let mut min_impure_var = String::new();
            for dim in &nest.dims {
                let Some(stride) = strides.get(&dim.name) else {
                    continue;
                };
                if !dim.is_rvar {
                    continue;
                }
                if expr::can_prove_lt(stride, &min_impure_stride) {
                    min_impure_stride = stride.clone();
                    min_impure_var = dim.name.clone();
                    // Reduction dims cannot be reordered past each other.
                    break;
                }
            }

            if min_pure_var.is_empty() && min_impure_var.is_empty() {
                return;
            }

            let chosen = if !min_impure_var.is_empty()
                && expr::can_prove_lt(&min_impure_stride, &min_pure_stride)
            {
                min_impure_var
            } else {
                min_pure_var
            };
            strides.remove(&chosen);
            order.push(chosen);
        }

        assert!(!order.is_empty());
        self.push_reorder(stage, nest, &order);
    }

    fn push_reorder(&mut self, stage: &StageRef, nest: &mut LoopNest, order: &[String]) {
        if !nest.differs_from(order) {
            return;
        }
        nest.reorder(order);
        let vars: Vec<&str> = order.iter().map(String::as_str).collect();
        self.sched.push(
            &stage.func,
            stage.stage,
            format!("reorder({})", order.join(", ")),
            &vars,
        );
    }
}
