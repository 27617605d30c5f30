// SPDX-License-Identifier: Apache-2.0

//! Two-sample Welch's t-test over the expression matrix.

use crate::stats::two_sided_p;
use cxg_core::CxgError;
use cxg_store::{ApproxDistribution, XArray, XLayout};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Deserialize;
use std::cmp::Ordering as CmpOrdering;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

const GROUP_A: u8 = 0b01;
const GROUP_B: u8 = 0b10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiffexConfig {
    pub max_workers: usize,
    pub cpu_multiplier: usize,
    /// Cells times variables processed per band, before tile alignment.
    pub target_work_unit: usize,
}

impl Default for DiffexConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            cpu_multiplier: 4,
            target_work_unit: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiffexRequest<'a> {
    /// Obs positions of each set. The sets may overlap; repeated positions
    /// within a set count once.
    pub set_a: &'a [usize],
    pub set_b: &'a [usize],
    pub top_n: usize,
    pub lfc_cutoff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffexRow {
    pub var_index: u32,
    pub log_fold_change: f64,
    pub p_value: f64,
    pub p_value_adj: f64,
    pub t_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffexResult {
    /// Descending t-score.
    pub positive: Vec<DiffexRow>,
    /// Ascending t-score.
    pub negative: Vec<DiffexRow>,
    /// True when too few variables cleared the LFC cutoff and ranking used
    /// every variable.
    pub lfc_fallback: bool,
}

/// Per-variable statistics of both sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStats {
    pub mean_a: Vec<f64>,
    pub var_a: Vec<f64>,
    pub mean_b: Vec<f64>,
    pub var_b: Vec<f64>,
}

impl GroupStats {
    fn with_capacity(n: usize) -> Self {
        Self {
            mean_a: Vec::with_capacity(n),
            var_a: Vec::with_capacity(n),
            mean_b: Vec::with_capacity(n),
            var_b: Vec::with_capacity(n),
        }
    }

    fn append(&mut self, mut other: Self) {
        self.mean_a.append(&mut other.mean_a);
        self.var_a.append(&mut other.var_a);
        self.mean_b.append(&mut other.mean_b);
        self.var_b.append(&mut other.var_b);
    }
}

/// Owns the process-wide worker pool, built on first use.
pub struct DiffexEngine {
    config: DiffexConfig,
    pool: OnceLock<Result<ThreadPool, String>>,
}

impl DiffexEngine {
    #[must_use]
    pub fn new(config: DiffexConfig) -> Self {
        Self {
            config,
            pool: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        let cpus = std::thread::available_parallelism().map_or(1, usize::from);
        self.config
            .max_workers
            .min(self.config.cpu_multiplier.saturating_mul(cpus))
            .max(1)
    }

    fn pool(&self) -> Result<&ThreadPool, CxgError> {
        self.pool
            .get_or_init(|| {
                let size = self.pool_size();
                tracing::info!(threads = size, "diffex worker pool starting");
                ThreadPoolBuilder::new()
                    .num_threads(size)
                    .thread_name(|i| format!("cxg-diffex-{i}"))
                    .build()
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| CxgError::compute(format!("diffex pool unavailable: {e}")))
    }

    pub fn run(
        &self,
        x: &XArray,
        distribution: ApproxDistribution,
        req: &DiffexRequest<'_>,
        cancel: &AtomicBool,
    ) -> Result<DiffexResult, CxgError> {
        let started = Instant::now();
        if let Some(bad) = req
            .set_a
            .iter()
            .chain(req.set_b)
            .find(|r| **r >= x.n_obs)
        {
            return Err(CxgError::filter(format!(
                "obs index {bad} out of range for {}",
                x.n_obs
            )));
        }
        let set_a = distinct(req.set_a);
        let set_b = distinct(req.set_b);
        let req = &DiffexRequest {
            set_a: &set_a,
            set_b: &set_b,
            ..*req
        };
        let bands = plan_bands(
            x.n_var,
            req.set_a.len() + req.set_b.len(),
            x.tile_extent[1],
            self.config.target_work_unit,
        );
        let stats = self.group_stats(x, distribution, req, &bands, cancel)?;
        let result = rank(&stats, req.set_a.len(), req.set_b.len(), req.top_n, req.lfc_cutoff);
        tracing::info!(
            n_a = req.set_a.len(),
            n_b = req.set_b.len(),
            n_var = x.n_var,
            bands = bands.len(),
            workers = self.pool_size(),
            lfc_fallback = result.lfc_fallback,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "diffex complete"
        );
        Ok(result)
    }

    /// Means and variances per variable, one pool task per band. The sets
    /// must hold distinct positions.
    fn group_stats(
        &self,
        x: &XArray,
        distribution: ApproxDistribution,
        req: &DiffexRequest<'_>,
        bands: &[Range<usize>],
        cancel: &AtomicBool,
    ) -> Result<GroupStats, CxgError> {
        let mut groups = vec![0_u8; x.n_obs];
        for r in req.set_a {
            groups[*r] |= GROUP_A;
        }
        for r in req.set_b {
            groups[*r] |= GROUP_B;
        }
        let abort = AtomicBool::new(false);
        let pool = self.pool()?;
        let parts: Vec<GroupStats> = pool.install(|| {
            bands
                .par_iter()
                .map(|band| {
                    if cancel.load(Ordering::Relaxed) || abort.load(Ordering::Relaxed) {
                        return Err(CxgError::compute("diffex cancelled"));
                    }
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        band_stats(x, distribution, band, req, &groups)
                    }))
                    .unwrap_or_else(|_| {
                        Err(CxgError::compute(format!(
                            "diffex worker failed on band {band:?}"
                        )))
                    });
                    if outcome.is_err() {
                        abort.store(true, Ordering::Relaxed);
                    }
                    outcome
                })
                .collect::<Result<Vec<_>, CxgError>>()
        })?;
        let mut stats = GroupStats::with_capacity(x.n_var);
        for part in parts {
            stats.append(part);
        }
        Ok(stats)
    }
}

/// Sorted positions with repeats removed, so every layout sees each set as
/// a mask.
fn distinct(set: &[usize]) -> Vec<usize> {
    let mut out = set.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Splits `0..n_var` into bands of whole tiles sized near `target` cells.
#[must_use]
pub fn plan_bands(
    n_var: usize,
    n_cells: usize,
    tile_cols: usize,
    target: usize,
) -> Vec<Range<usize>> {
    let tile_cols = tile_cols.max(1);
    let tiles = (target / n_cells.max(1).saturating_mul(tile_cols)).max(1);
    let width = tiles.saturating_mul(tile_cols);
    (0..n_var)
        .step_by(width)
        .map(|start| start..(start + width).min(n_var))
        .collect()
}

/// Calls `f(group, column offset, value)` for every stored entry of the band
/// in rows of either set. Dense layouts visit zeros too; sparse ones do not.
fn visit_band(
    x: &XArray,
    band: &Range<usize>,
    req: &DiffexRequest<'_>,
    groups: &[u8],
    f: &mut dyn FnMut(u8, usize, f32),
) {
    match &x.layout {
        XLayout::Dense(data) => {
            for (rows, group) in [(req.set_a, GROUP_A), (req.set_b, GROUP_B)] {
                for r in rows {
                    let row = &data[r * x.n_var..(r + 1) * x.n_var];
                    for (offset, v) in row[band.clone()].iter().enumerate() {
                        f(group, offset, *v);
                    }
                }
            }
        }
        XLayout::Sparse { cols: Some(csc), .. } => {
            for c in band.clone() {
                let (rows, vals) = csc.lane(c);
                for (r, v) in rows.iter().zip(vals) {
                    let g = groups[*r as usize];
                    if g & GROUP_A != 0 {
                        f(GROUP_A, c - band.start, *v);
                    }
                    if g & GROUP_B != 0 {
                        f(GROUP_B, c - band.start, *v);
                    }
                }
            }
        }
        XLayout::Sparse { rows: csr, .. } => {
            for (rows, group) in [(req.set_a, GROUP_A), (req.set_b, GROUP_B)] {
                for r in rows {
                    let (cols, vals) = csr.lane(*r);
                    let lo = cols.partition_point(|c| (*c as usize) < band.start);
                    let hi = cols.partition_point(|c| (*c as usize) < band.end);
                    for (c, v) in cols[lo..hi].iter().zip(&vals[lo..hi]) {
                        f(group, *c as usize - band.start, *v);
                    }
                }
            }
        }
    }
}

/// Two passes over the band: means first, then squared deviations. Entries a
/// sparse layout does not store are zeros and are added back analytically.
fn band_stats(
    x: &XArray,
    distribution: ApproxDistribution,
    band: &Range<usize>,
    req: &DiffexRequest<'_>,
    groups: &[u8],
) -> Result<GroupStats, CxgError> {
    let width = band.len();
    let transform = |v: f32| -> f64 {
        let v = f64::from(v);
        match distribution {
            ApproxDistribution::Normal => v,
            ApproxDistribution::Count => v.ln_1p(),
        }
    };
    let n = [req.set_a.len() as f64, req.set_b.len() as f64];
    let slot = |g: u8| usize::from(g == GROUP_B);

    let mut sum = [vec![0.0_f64; width], vec![0.0_f64; width]];
    let mut seen = [vec![0_u64; width], vec![0_u64; width]];
    visit_band(x, band, req, groups, &mut |g, c, v| {
        let s = slot(g);
        sum[s][c] += transform(v);
        seen[s][c] += 1;
    });
    let mean: [Vec<f64>; 2] = [0, 1].map(|s| sum[s].iter().map(|t| t / n[s]).collect());

    let mut sq = [vec![0.0_f64; width], vec![0.0_f64; width]];
    visit_band(x, band, req, groups, &mut |g, c, v| {
        let s = slot(g);
        let d = transform(v) - mean[s][c];
        sq[s][c] += d * d;
    });
    let var: [Vec<f64>; 2] = [0, 1].map(|s| {
        (0..width)
            .map(|c| {
                let zeros = n[s] - seen[s][c] as f64;
                (sq[s][c] + zeros * mean[s][c] * mean[s][c]) / (n[s] - 1.0)
            })
            .collect()
    });

    let finite = |v: Vec<f64>| -> Vec<f64> {
        v.into_iter()
            .map(|x| if x.is_finite() { x } else { 0.0 })
            .collect()
    };
    let [mean_a, mean_b] = mean;
    let [var_a, var_b] = var;
    Ok(GroupStats {
        mean_a: finite(mean_a),
        var_a: finite(var_a),
        mean_b: finite(mean_b),
        var_b: finite(var_b),
    })
}

/// Welch statistics and top-N ranking.
///
/// Variances are scaled by `min(nA, nB)` rather than each set's own size, and
/// p-values are Bonferroni-adjusted over all variables.
#[must_use]
pub fn rank(stats: &GroupStats, n_a: usize, n_b: usize, top_n: usize, lfc_cutoff: f64) -> DiffexResult {
    let n_var = stats.mean_a.len();
    let min_n = n_a.min(n_b) as f64;
    let (na, nb) = (n_a as f64, n_b as f64);
    let mut t_scores = Vec::with_capacity(n_var);
    let mut rows = Vec::with_capacity(n_var);
    for i in 0..n_var {
        let vn_a = stats.var_a[i] / min_n;
        let vn_b = stats.var_b[i] / min_n;
        let sum_vn = vn_a + vn_b;
        let mut dof = sum_vn * sum_vn / (vn_a * vn_a / (na - 1.0) + vn_b * vn_b / (nb - 1.0));
        if !dof.is_finite() {
            dof = 1.0;
        }
        let diff = stats.mean_a[i] - stats.mean_b[i];
        let mut t = diff / sum_vn.sqrt();
        if t.is_nan() {
            t = 0.0;
        }
        let p = two_sided_p(t, dof);
        t_scores.push(t);
        rows.push(DiffexRow {
            var_index: i as u32,
            log_fold_change: diff,
            p_value: p,
            p_value_adj: (p * n_var as f64).min(1.0),
            t_score: t,
        });
    }

    let above: Vec<usize> = (0..n_var)
        .filter(|i| rows[*i].log_fold_change.abs() > lfc_cutoff)
        .collect();
    let lfc_fallback = above.len() <= 2 * top_n;
    let mut pool = if lfc_fallback {
        (0..n_var).collect()
    } else {
        above
    };
    let by_t_desc =
        |a: &usize, b: &usize| -> CmpOrdering { t_scores[*b].total_cmp(&t_scores[*a]).then(a.cmp(b)) };

    let (mut top, mut bottom): (Vec<usize>, Vec<usize>) = if pool.len() > 2 * top_n && top_n > 0 {
        pool.select_nth_unstable_by(top_n - 1, by_t_desc);
        let (head, rest) = pool.split_at_mut(top_n);
        let k = rest.len() - top_n;
        rest.select_nth_unstable_by(k, by_t_desc);
        (head.to_vec(), rest[k..].to_vec())
    } else {
        pool.sort_by(by_t_desc);
        let top = pool.iter().take(top_n).copied().collect();
        let bottom = pool.iter().rev().take(top_n).copied().collect();
        (top, bottom)
    };
    top.sort_by(by_t_desc);
    bottom.sort_by(|a, b| by_t_desc(b, a));
    DiffexResult {
        positive: top.into_iter().map(|i| rows[i]).collect(),
        negative: bottom.into_iter().map(|i| rows[i]).collect(),
        lfc_fallback,
    }
}
