use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pipeline::ScalarType;

/// Parameters of the machine model driving the cost estimates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MachineParams {
    /// Parallel task count the schedule should saturate.
    pub parallelism: i64,
    /// Last-level cache size in bytes.
    pub last_level_cache_size: i64,
    /// Dimensionless memory-versus-arithmetic trade-off; caps the per-load
    /// penalty.
    pub balance: i64,
}

impl Default for MachineParams {
    fn default() -> MachineParams {
        MachineParams {
            parallelism: 16,
            last_level_cache_size: 16 * 1024 * 1024,
            balance: 40,
        }
    }
}

impl MachineParams {
    pub fn load_slope(&self) -> f64 {
        self.balance as f64 / self.last_level_cache_size as f64
    }
}

impl fmt::Display for MachineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.parallelism, self.last_level_cache_size, self.balance
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unable to parse MachineParams: {0}")]
pub struct ParseMachineParamsError(String);

impl FromStr for MachineParams {
    type Err = ParseMachineParamsError;

    fn from_str(s: &str) -> Result<MachineParams, ParseMachineParamsError> {
        let fields: Vec<&str> = s.split(',').collect();
        let [parallelism, cache, balance] = fields[..] else {
            return Err(ParseMachineParamsError(s.to_string()));
        };
        let parse = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| ParseMachineParamsError(s.to_string()))
        };
        Ok(MachineParams {
            parallelism: parse(parallelism)?,
            last_level_cache_size: parse(cache)?,
            balance: parse(balance)?,
        })
    }
}

/// The code-generation target, as far as scheduling is concerned: a name for
/// the preamble and the SIMD register width.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Target {
    pub name: String,
    pub vector_bits: u32,
}

impl Target {
    pub fn host() -> Target {
        Target {
            name: "x86-64-linux-avx2".to_string(),
            vector_bits: 256,
        }
    }

    /// SIMD lanes of the target's vector registers for a scalar type.
    pub fn natural_vector_size(&self, ty: ScalarType) -> i64 {
        i64::from(self.vector_bits / 8) / ty.bytes()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
