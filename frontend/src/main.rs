use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use terrace::expr::{call, imm, var};
use terrace::pipeline::{Function, Pipeline, ReductionVar, ScalarType};
use terrace::{generate_schedule, MachineParams, Target};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Machine parameters as "parallelism,last_level_cache_size,balance"
    #[arg(long, short)]
    params: Option<String>,

    #[command(subcommand)]
    pipeline: Demo,
}

#[derive(Subcommand)]
enum Demo {
    /// Two-stage box blur over an input image
    Blur {
        #[arg(long, default_value_t = 2048)]
        size: i64,
    },
    /// A chain of cheap pointwise stages
    Chain {
        #[arg(long, default_value_t = 1536)]
        size: i64,
    },
    /// Histogram of an input image, then bin normalization
    Histogram {
        #[arg(long, default_value_t = 1024)]
        size: i64,
    },
}

fn blur(size: i64) -> Pipeline {
    let blur_x = Function::new("blur_x", &["x", "y"]).define(
        (call("input", vec![var("x") - imm(1), var("y")])
            + call("input", vec![var("x"), var("y")])
            + call("input", vec![var("x") + imm(1), var("y")]))
            / imm(3),
    );
    let blur_y = Function::new("blur_y", &["x", "y"])
        .define(
            (call("blur_x", vec![var("x"), var("y") - imm(1)])
                + call("blur_x", vec![var("x"), var("y")])
                + call("blur_x", vec![var("x"), var("y") + imm(1)]))
                / imm(3),
        )
        .with_estimate("x", 0, size)
        .with_estimate("y", 0, size);
    Pipeline::new(vec![blur_x, blur_y], &["blur_y"]).with_input("input", 2, ScalarType::Float32)
}

fn chain(size: i64) -> Pipeline {
    let a = Function::new("a", &["x", "y"])
        .define(call("input", vec![var("x"), var("y")]) * imm(2));
    let b = Function::new("b", &["x", "y"]).define(call("a", vec![var("x"), var("y")]) + imm(7));
    let c = Function::new("c", &["x", "y"])
        .define(call("b", vec![var("x"), var("y")]) * call("b", vec![var("x"), var("y")]))
        .with_estimate("x", 0, size)
        .with_estimate("y", 0, size);
    Pipeline::new(vec![a, b, c], &["c"]).with_input("input", 2, ScalarType::Float32)
}

fn histogram(size: i64) -> Pipeline {
    let hist = Function::new("hist", &["i"])
        .define(imm(0))
        .update(
            vec![call("input", vec![var("rx"), var("ry")])],
            call("hist", vec![call("input", vec![var("rx"), var("ry")])]) + imm(1),
            vec![
                ReductionVar {
                    name: "rx".to_string(),
                    min: imm(0),
                    extent: imm(size),
                },
                ReductionVar {
                    name: "ry".to_string(),
                    min: imm(0),
                    extent: imm(size),
                },
            ],
        )
        .with_estimate("i", 0, 256)
        .with_types(vec![ScalarType::Int32]);
    let cdf = Function::new("cdf", &["i"])
        .define(call("hist", vec![var("i")]) * imm(256) / imm(size * size))
        .with_estimate("i", 0, 256)
        .with_types(vec![ScalarType::Int32]);
    Pipeline::new(vec![hist, cdf], &["cdf"]).with_input("input", 2, ScalarType::UInt8)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let params = match &args.params {
        Some(s) => s.parse::<MachineParams>()?,
        None => MachineParams::default(),
    };
    let target = Target::host();

    let pipeline = match args.pipeline {
        Demo::Blur { size } => blur(size),
        Demo::Chain { size } => chain(size),
        Demo::Histogram { size } => histogram(size),
    };

    info!("scheduling for {} with params {}", target, params);
    let start = std::time::Instant::now();
    let schedule = generate_schedule(&pipeline, &target, &params)?;
    info!("scheduling took {:?}", start.elapsed());

    println!("{}", schedule);
    Ok(())
}
