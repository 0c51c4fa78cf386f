//! Equality strategies deciding whether an existing target already matches
//! the desired one.

use std::hash::Hasher;
use std::sync::Arc;

use ferry_core::config::ComparerKind;
use rustc_hash::FxHasher;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::{diff_summary, strip_noisy};

/// Object-safe over JSON so one comparer instance serves every target kind.
pub trait ResourceComparer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `existing = None` never equals a desired value.
    fn equal(&self, desired: &Json, existing: Option<&Json>) -> bool;
}

/// Hash of the normalized serialized form.
#[derive(Debug, Default, Clone, Copy)]
pub struct FastComparer;

impl FastComparer {
    fn fingerprint(v: &Json) -> Option<(usize, u64)> {
        let bytes = serde_json::to_vec(&strip_noisy(v.clone())).ok()?;
        let mut h = FxHasher::default();
        h.write(&bytes);
        Some((bytes.len(), h.finish()))
    }
}

impl ResourceComparer for FastComparer {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn equal(&self, desired: &Json, existing: Option<&Json>) -> bool {
        let Some(existing) = existing else { return false };
        match (Self::fingerprint(desired), Self::fingerprint(existing)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Structural deep equality; logs what differs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlowComparer;

impl ResourceComparer for SlowComparer {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn equal(&self, desired: &Json, existing: Option<&Json>) -> bool {
        let Some(existing) = existing else { return false };
        let (a, b) = (strip_noisy(desired.clone()), strip_noisy(existing.clone()));
        if a == b {
            return true;
        }
        let s = diff_summary(&a, &b);
        debug!(adds = s.adds, updates = s.updates, removes = s.removes, "desired differs from existing");
        false
    }
}

pub fn comparer_for(kind: ComparerKind) -> Arc<dyn ResourceComparer> {
    match kind {
        ComparerKind::Fast => Arc::new(FastComparer),
        ComparerKind::Slow => Arc::new(SlowComparer),
    }
}

/// Typed front door for callers holding projections.
pub fn are_equal<T: Serialize>(comparer: &dyn ResourceComparer, desired: &T, existing: Option<&T>) -> bool {
    let desired = match serde_json::to_value(desired) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, comparer = comparer.name(), "desired value not serializable; treating as unequal");
            return false;
        }
    };
    let existing = match existing.map(serde_json::to_value).transpose() {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, comparer = comparer.name(), "existing value not serializable; treating as unequal");
            return false;
        }
    };
    comparer.equal(&desired, existing.as_ref())
}
