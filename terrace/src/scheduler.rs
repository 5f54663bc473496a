use log::debug;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::costs::RegionCosts;
use crate::emitter::Emitter;
use crate::machine::{MachineParams, Target};
use crate::partitioner::{Level, Partitioner};
use crate::pipeline::Pipeline;
use crate::regions::{pipeline_bounds, unbounded_functions, DependenceAnalysis};

#[derive(Debug, Error)]
pub enum Error {
    #[error("output function \"{func}\" is not in the pipeline environment")]
    UnknownOutput { func: String },
    #[error("please provide a valid estimate for dimension {dim} of output \"{func}\"")]
    MissingEstimate { func: String, dim: String },
}

/// Generate the schedule for every function required to compute the
/// pipeline outputs, and return its text rendition.
pub fn generate_schedule(
    pipeline: &Pipeline,
    target: &Target,
    params: &MachineParams,
) -> Result<String, Error> {
    check_estimates_on_outputs(pipeline)?;

    debug!("initializing dependence analysis");
    let dep = DependenceAnalysis::new(pipeline);
    let costs = RegionCosts::new(pipeline);

    debug!("computing pipeline bounds");
    let bounds = pipeline_bounds(&dep);
    let unbounded = unbounded_functions(&bounds, pipeline);

    debug!("initializing partitioner");
    let mut part = Partitioner::new(
        bounds,
        *params,
        &dep,
        &costs,
        pipeline.outputs.clone(),
        &unbounded,
    );
    part.initialize_groups();

    debug!("grouping for inlining");
    part.group(Level::Inline, &BTreeMap::new());

    debug!("grouping for fast memory");
    part.clear_grouping_cache();
    part.group_recurse();
    part.check_invariants();
    part.log_grouping();

    let sched = Emitter::generate(&part, target);
    Ok(format!(
        "// Target: {}\n// MachineParams: {}\n\n{}",
        target, params, sched
    ))
}

/// Every output dimension must carry a concrete integer min and extent
/// estimate before any analysis can run.
fn check_estimates_on_outputs(pipeline: &Pipeline) -> Result<(), Error> {
    for out in &pipeline.outputs {
        let Some(f) = pipeline.env.get(out) else {
            return Err(Error::UnknownOutput { func: out.clone() });
        };
        for arg in &f.args {
            let concrete = f
                .estimate_for(arg)
                .is_some_and(|est| est.min.as_imm().is_some() && est.extent.as_imm().is_some());
            if !concrete {
                return Err(Error::MissingEstimate {
                    func: out.clone(),
                    dim: arg.clone(),
                });
            }
        }
    }
    Ok(())
}
