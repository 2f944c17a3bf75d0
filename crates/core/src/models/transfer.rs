//! Name-based parameter transfer between two `VarMap`s.
//!
//! Every source name lands in exactly one bucket:
//! - `excluded`: matched a deny prefix (the generation head)
//! - `aliased`: matched a shared prefix; the target already holds the very
//!   same tensors so nothing is copied
//! - `skipped`: the target defines no parameter of that name
//! - `copied`: value copied into the target's own storage
//!
//! Target names no source entry reached are reported as `untouched` and keep
//! whatever initialization they were built with.

use std::collections::BTreeMap;

use candle_core::Var;
use candle_nn::VarMap;

use super::ModelError;

/// Prefix of the generation head parameters.
pub const LM_HEAD_PREFIX: &str = "lm_head";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Skipped names are logged and reported.
    #[default]
    Lenient,
    /// Any skipped name fails the transfer.
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    exclude_prefixes: Vec<String>,
    alias_prefixes: Vec<String>,
    mode: TransferMode,
}

impl TransferPlan {
    pub fn new(mode: TransferMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Never copy names under `prefix`.
    pub fn exclude(mut self, prefix: &str) -> Self {
        self.exclude_prefixes.push(prefix.to_string());
        self
    }

    /// Names under `prefix` are shared with the target, not copied.
    pub fn alias(mut self, prefix: &str) -> Self {
        self.alias_prefixes.push(prefix.to_string());
        self
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }
}

/// Prefix match on a dotted parameter path: `lm_head` matches `lm_head.weight`
/// but not `lm_head_extra.weight`.
fn under_prefix(name: &str, prefix: &str) -> bool {
    name == prefix
        || name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub copied: Vec<String>,
    pub excluded: Vec<String>,
    pub aliased: Vec<String>,
    pub skipped: Vec<String>,
    pub untouched: Vec<String>,
}

impl TransferReport {
    pub fn log(&self) {
        tracing::info!(
            copied = self.copied.len(),
            excluded = self.excluded.len(),
            aliased = self.aliased.len(),
            skipped = self.skipped.len(),
            untouched = self.untouched.len(),
            "weight transfer complete"
        );
        if !self.skipped.is_empty() {
            tracing::warn!(
                count = self.skipped.len(),
                names = ?self.skipped,
                "source parameters absent from target were skipped"
            );
        }
    }
}

/// Snapshot of a `VarMap` ordered by name.
///
/// A poisoned lock only means another thread panicked mid-insert; the map
/// itself is still readable.
pub fn named_vars(map: &VarMap) -> BTreeMap<String, Var> {
    let data = map
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Apply `plan`, copying values from `source` into `target`.
pub fn transfer(
    source: &VarMap,
    target: &VarMap,
    plan: &TransferPlan,
) -> Result<TransferReport, ModelError> {
    let source = named_vars(source);
    let target = named_vars(target);
    let mut report = TransferReport::default();
    let mut reached = std::collections::BTreeSet::new();

    for (name, src) in &source {
        if plan.exclude_prefixes.iter().any(|p| under_prefix(name, p)) {
            report.excluded.push(name.clone());
            continue;
        }
        if plan.alias_prefixes.iter().any(|p| under_prefix(name, p)) {
            reached.insert(name.as_str());
            report.aliased.push(name.clone());
            continue;
        }
        let Some(dst) = target.get(name) else {
            report.skipped.push(name.clone());
            continue;
        };
        if src.shape() != dst.shape() {
            return Err(ModelError::ParameterShape {
                name: name.clone(),
                expected: dst.dims().to_vec(),
                found: src.dims().to_vec(),
            });
        }
        let value = src
            .as_tensor()
            .to_device(dst.device())?
            .to_dtype(dst.dtype())?;
        dst.set(&value)?;
        reached.insert(name.as_str());
        report.copied.push(name.clone());
    }

    report.untouched = target
        .keys()
        .filter(|name| !reached.contains(name.as_str()))
        .cloned()
        .collect();

    if plan.mode == TransferMode::Strict && !report.skipped.is_empty() {
        return Err(ModelError::StrictTransfer(report.skipped));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn map_with(names: &[(&str, usize)]) -> VarMap {
        let map = VarMap::new();
        for &(name, width) in names {
            map.get(width, name, Init::Randn { mean: 0.0, stdev: 1.0 }, DType::F32, &Device::Cpu)
                .unwrap();
        }
        map
    }

    fn values(map: &VarMap, name: &str) -> Vec<f32> {
        named_vars(map)[name].as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn prefix_matching_respects_path_boundaries() {
        assert!(under_prefix("lm_head.weight", "lm_head"));
        assert!(under_prefix("lm_head", "lm_head"));
        assert!(!under_prefix("lm_head_extra.weight", "lm_head"));
        assert!(!under_prefix("model.lm_head.weight", "lm_head"));
    }

    #[test]
    fn buckets_every_name() {
        let source = map_with(&[
            ("lm_head.weight", 4),
            ("model.norm.weight", 4),
            ("model.vision_tower.w", 4),
            ("model.extra.weight", 4),
        ]);
        let target = map_with(&[
            ("model.norm.weight", 4),
            ("model.vision_tower.w", 4),
            ("reward_head.0.weight", 4),
        ]);
        let plan = TransferPlan::new(TransferMode::Lenient)
            .exclude(LM_HEAD_PREFIX)
            .alias("model.vision_tower");

        let report = transfer(&source, &target, &plan).unwrap();
        assert_eq!(report.copied, vec!["model.norm.weight"]);
        assert_eq!(report.excluded, vec!["lm_head.weight"]);
        assert_eq!(report.aliased, vec!["model.vision_tower.w"]);
        assert_eq!(report.skipped, vec!["model.extra.weight"]);
        assert_eq!(report.untouched, vec!["reward_head.0.weight"]);

        assert_eq!(
            values(&source, "model.norm.weight"),
            values(&target, "model.norm.weight")
        );
    }

    #[test]
    fn copy_does_not_share_storage() {
        let source = map_with(&[("a", 3)]);
        let target = map_with(&[("a", 3)]);
        transfer(&source, &target, &TransferPlan::default()).unwrap();

        let before = values(&target, "a");
        named_vars(&source)["a"]
            .set(&Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        assert_eq!(values(&target, "a"), before);
    }

    #[test]
    fn strict_mode_rejects_skips() {
        let source = map_with(&[("a", 2), ("b", 2)]);
        let target = map_with(&[("a", 2)]);
        let err = transfer(&source, &target, &TransferPlan::new(TransferMode::Strict));
        assert!(matches!(err, Err(ModelError::StrictTransfer(names)) if names == vec!["b"]));
    }

    #[test]
    fn shape_disagreement_is_an_error() {
        let source = map_with(&[("a", 2)]);
        let target = map_with(&[("a", 3)]);
        let err = transfer(&source, &target, &TransferPlan::default());
        assert!(matches!(err, Err(ModelError::ParameterShape { .. })));
    }

    #[test]
    fn dtype_follows_target() {
        let source = map_with(&[("a", 2)]);
        let target = VarMap::new();
        VarBuilder::from_varmap(&target, DType::F64, &Device::Cpu)
            .get(2, "a")
            .unwrap();
        transfer(&source, &target, &TransferPlan::default()).unwrap();
        assert_eq!(named_vars(&target)["a"].dtype(), DType::F64);
    }
}
