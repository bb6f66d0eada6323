//! Tagged dispatch table from kernel metadata to operator constructors.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Backend;
use crate::hparams::UnifiedGemmHParams;
use crate::operator::GemmOperator;
use crate::schedule::GemmKind;
use crate::{DType, Error, Result};

/// Kernel generation an instantiation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelFlavor {
    /// Older kernels; no programmatic dependent launch.
    Legacy,
    /// Newer kernels; PDL capable.
    Universal,
}

/// What an operator computes, independent of how it is tuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmMeta {
    pub kind: GemmKind,
    pub input_dtype: DType,
    pub output_dtype: DType,
    pub flavor: KernelFlavor,
}

impl GemmMeta {
    pub fn new(kind: GemmKind, input_dtype: DType, output_dtype: DType, flavor: KernelFlavor) -> Self {
        Self {
            kind,
            input_dtype,
            output_dtype,
            flavor,
        }
    }
}

impl fmt::Display for GemmMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}_{}_{}_{:?}",
            self.kind, self.input_dtype, self.output_dtype, self.flavor
        )
    }
}

/// Builds a fresh operator instance.
pub type OpFactory<B> = Box<dyn Fn() -> Box<dyn GemmOperator<B>> + Send + Sync>;

struct Entry<B: Backend> {
    meta: GemmMeta,
    hparams: UnifiedGemmHParams,
    factory: OpFactory<B>,
}

/// Registry of operator instantiations keyed by [`GemmMeta`] and
/// [`UnifiedGemmHParams`].
pub struct OpRegistry<B: Backend> {
    // First entry per meta is its default.
    entries: HashMap<GemmMeta, Vec<Entry<B>>>,
}

impl<B: Backend> Default for OpRegistry<B> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<B: Backend> OpRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instantiation.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if the same (meta, hparams) pair is
    /// already registered.
    pub fn register(
        &mut self,
        meta: GemmMeta,
        hparams: UnifiedGemmHParams,
        factory: OpFactory<B>,
    ) -> Result<()> {
        let list = self.entries.entry(meta).or_default();
        if list.iter().any(|e| e.hparams == hparams) {
            return Err(Error::invalid(format!(
                "{meta} with {hparams} registered twice"
            )));
        }
        list.push(Entry {
            meta,
            hparams,
            factory,
        });
        Ok(())
    }

    /// Instantiate the operator for `meta`, optionally pinned to `hparams`.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if nothing matches.
    pub fn get_op(
        &self,
        meta: &GemmMeta,
        hparams: Option<&UnifiedGemmHParams>,
    ) -> Result<Box<dyn GemmOperator<B>>> {
        let candidates = self
            .entries
            .get(meta)
            .ok_or_else(|| Error::invalid(format!("no operator registered for {meta}")))?;
        let entry = match hparams {
            Some(hp) => candidates
                .iter()
                .find(|e| &e.hparams == hp)
                .ok_or_else(|| Error::invalid(format!("no {meta} operator with {hp}")))?,
            None => candidates
                .first()
                .ok_or_else(|| Error::invalid(format!("no operator registered for {meta}")))?,
        };
        debug!(meta = %entry.meta, hparams = %entry.hparams, "selected gemm operator");
        Ok((entry.factory)())
    }

    /// Every registered (meta, hparams) pair.
    pub fn list(&self) -> Vec<(GemmMeta, UnifiedGemmHParams)> {
        self.entries
            .values()
            .flatten()
            .map(|e| (e.meta, e.hparams))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_display() {
        let meta = GemmMeta::new(GemmKind::ReduceScatter, DType::F16, DType::F16, KernelFlavor::Universal);
        assert_eq!(meta.to_string(), "ReduceScatter_f16_f16_Universal");
    }
}
