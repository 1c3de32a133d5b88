//! Parameter storage.
//!
//! Every trainable tensor lives in a [`ParamStore`] under a structured
//! [`ParamPath`]. Encoders create their parameters once at construction and
//! keep `Tensor` handles to the underlying [`Var`]s, so an external optimizer
//! sees the same storage through [`ParamStore::all_vars`].
//!
//! Initial values come from a seeded `ChaCha8Rng`: two stores with the same
//! seed hand out identical weights for the same sequence of requests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Shape, Tensor, Var};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::{Error, Result};

/// Structured parameter identifier, e.g. `vgg_blstm_encoder / vgg1 / conv1 / weight`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamPath {
    segments: Vec<String>,
}

impl ParamPath {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    /// Child path one scope deeper.
    pub fn pp(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether `self` lies under `prefix`.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Initial value distribution for a new parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Every element set to the constant.
    Const(f64),
    /// Uniform in `[-range, +range]`.
    Uniform { range: f64 },
    /// Normal(0, stddev), values beyond two stddevs redrawn.
    TruncatedNormal { stddev: f64 },
    /// Glorot uniform over the first (fan-in) and last (fan-out) dimensions.
    XavierUniform,
}

impl Init {
    fn sample(&self, shape: &Shape, rng: &mut ChaCha8Rng) -> Result<Vec<f32>> {
        let n = shape.elem_count();
        let values = match *self {
            Self::Const(v) => vec![v as f32; n],
            Self::Uniform { range } => (0..n)
                .map(|_| rng.random_range(-range..=range) as f32)
                .collect(),
            Self::TruncatedNormal { stddev } => {
                let normal = Normal::new(0.0, stddev)
                    .map_err(|e| Error::Config(format!("truncated normal stddev {stddev}: {e}")))?;
                let bound = 2.0 * stddev;
                (0..n)
                    .map(|_| loop {
                        let v: f64 = normal.sample(rng);
                        if v.abs() <= bound {
                            break v as f32;
                        }
                    })
                    .collect()
            }
            Self::XavierUniform => {
                let dims = shape.dims();
                let (fan_in, fan_out) = match dims {
                    [] => (1, 1),
                    [d] => (*d, *d),
                    [first, .., last] => (*first, *last),
                };
                let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
                (0..n)
                    .map(|_| rng.random_range(-limit..=limit) as f32)
                    .collect()
            }
        };
        Ok(values)
    }
}

/// Owner of every trainable variable created by the encoders.
#[derive(Debug)]
pub struct ParamStore {
    device: Device,
    dtype: DType,
    inner: Mutex<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    vars: BTreeMap<ParamPath, Var>,
    rng: ChaCha8Rng,
}

impl ParamStore {
    pub fn new(device: &Device, dtype: DType, seed: u64) -> Self {
        Self {
            device: device.clone(),
            dtype,
            inner: Mutex::new(StoreInner {
                vars: BTreeMap::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Inserts are atomic under the lock, so a poisoned map is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a new parameter at `path`.
    ///
    /// Fails with [`Error::DuplicateParam`] if `path` already exists.
    pub fn create<S: Into<Shape>>(
        &self,
        path: &ParamPath,
        shape: S,
        init: Init,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let mut inner = self.lock();
        if inner.vars.contains_key(path) {
            return Err(Error::DuplicateParam(path.to_string()));
        }
        let values = init.sample(&shape, &mut inner.rng)?;
        let tensor = Tensor::from_vec(values, shape, &self.device)?.to_dtype(self.dtype)?;
        let var = Var::from_tensor(&tensor)?;
        let handle = var.as_tensor().clone();
        tracing::trace!(param = %path, shape = ?handle.dims(), "created parameter");
        inner.vars.insert(path.clone(), var);
        Ok(handle)
    }

    /// Look up an existing parameter.
    pub fn get(&self, path: &ParamPath) -> Result<Tensor> {
        self.lock()
            .vars
            .get(path)
            .map(|v| v.as_tensor().clone())
            .ok_or_else(|| Error::MissingParam(path.to_string()))
    }

    pub fn contains(&self, path: &ParamPath) -> bool {
        self.lock().vars.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().vars.is_empty()
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<ParamPath> {
        self.lock().vars.keys().cloned().collect()
    }

    /// Paths under `prefix`, sorted.
    pub fn paths_under(&self, prefix: &ParamPath) -> Vec<ParamPath> {
        self.lock()
            .vars
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Variables for an optimizer, in path order.
    pub fn all_vars(&self) -> Vec<Var> {
        self.lock().vars.values().cloned().collect()
    }

    /// Total number of scalar parameters under `prefix`.
    pub fn num_elements_under(&self, prefix: &ParamPath) -> usize {
        self.lock()
            .vars
            .iter()
            .filter(|(p, _)| p.starts_with(prefix))
            .map(|(_, v)| v.elem_count())
            .sum()
    }
}
