//! Hard-thresholding projections onto sparse supports.
//!
//! Every projection ranks entries by `|v[i]| * weight[i]` (weight one when no prior is
//! given) in descending order, breaking ties by ascending index, so the retained support
//! is a deterministic function of the input. The support mask is always overwritten and
//! has exactly as many set entries as there are retained slots, even when some of the
//! retained values are zero.

use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Group membership for group-sparse projection.
///
/// `labels[j]` is the group of predictor `j`. At most `max_groups` groups survive a
/// projection and each surviving group keeps at most `k` of its members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub labels: Vec<usize>,
    pub max_groups: usize,
}

impl GroupSpec {
    /// Members of each group in ascending label order, members ascending within a group.
    pub fn members(&self) -> Vec<(usize, Vec<usize>)> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (j, &label) in self.labels.iter().enumerate() {
            groups.entry(label).or_default().push(j);
        }
        groups.into_iter().collect()
    }
}

#[derive(Clone, Debug)]
pub enum Projection {
    TopK,
    Weighted(Array1<f64>),
    Group {
        members: Vec<(usize, Vec<usize>)>,
        max_groups: usize,
        weights: Option<Array1<f64>>,
    },
}

impl Projection {
    pub fn new(weights: Option<Array1<f64>>, groups: Option<&GroupSpec>) -> Self {
        match (groups, weights) {
            (Some(spec), weights) => Projection::Group {
                members: spec.members(),
                max_groups: spec.max_groups,
                weights,
            },
            (None, Some(weights)) => Projection::Weighted(weights),
            (None, None) => Projection::TopK,
        }
    }

    /// Zeroes everything outside the retained support of `v` and rewrites `mask`.
    pub fn apply(&self, mut v: ArrayViewMut1<'_, f64>, k: usize, mask: &mut [bool]) {
        debug_assert_eq!(v.len(), mask.len());
        let keep = match self {
            Projection::TopK => top_k_indices(v.view(), None, k),
            Projection::Weighted(weights) => top_k_indices(v.view(), Some(weights.view()), k),
            Projection::Group {
                members,
                max_groups,
                weights,
            } => group_indices(v.view(), weights.as_ref().map(|w| w.view()), members, *max_groups, k),
        };
        mask.fill(false);
        for &i in &keep {
            mask[i] = true;
        }
        for (value, &kept) in v.iter_mut().zip(mask.iter()) {
            if !kept {
                *value = 0.0;
            }
        }
    }
}

#[inline]
fn descending(scores: &[f64], a: usize, b: usize) -> Ordering {
    scores[b].total_cmp(&scores[a]).then(a.cmp(&b))
}

fn scores(v: ArrayView1<'_, f64>, weights: Option<ArrayView1<'_, f64>>) -> Vec<f64> {
    match weights {
        Some(w) => v.iter().zip(w.iter()).map(|(x, w)| x.abs() * w).collect(),
        None => v.iter().map(|x| x.abs()).collect(),
    }
}

/// Picks the `k` best-ranked entries of `candidates`, returned in ascending index order.
fn select_from(scores: &[f64], mut candidates: Vec<usize>, k: usize) -> Vec<usize> {
    let k = k.min(candidates.len());
    if k == 0 {
        return Vec::new();
    }
    if k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, |&a, &b| descending(scores, a, b));
        candidates.truncate(k);
    }
    candidates.sort_unstable();
    candidates
}

/// Indices of the `k` largest `|v| * w`, ascending.
pub fn top_k_indices(
    v: ArrayView1<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
    k: usize,
) -> Vec<usize> {
    let scores = scores(v, weights);
    select_from(&scores, (0..v.len()).collect(), k)
}

fn group_indices(
    v: ArrayView1<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
    members: &[(usize, Vec<usize>)],
    max_groups: usize,
    k: usize,
) -> Vec<usize> {
    let scores = scores(v, weights);
    let mut ranked: Vec<(f64, Vec<usize>)> = members
        .iter()
        .map(|(_, group)| {
            let kept = select_from(&scores, group.clone(), k);
            let norm = kept.iter().map(|&i| scores[i] * scores[i]).sum::<f64>().sqrt();
            (norm, kept)
        })
        .collect();
    // Stable sort keeps ascending label order among groups with equal norms.
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut keep: Vec<usize> = ranked
        .into_iter()
        .take(max_groups)
        .flat_map(|(_, kept)| kept)
        .collect();
    keep.sort_unstable();
    keep
}
