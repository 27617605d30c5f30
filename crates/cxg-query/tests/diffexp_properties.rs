// SPDX-License-Identifier: Apache-2.0

use cxg_query::{DiffexConfig, DiffexEngine, DiffexRequest, DiffexResult, DiffexRow};
use cxg_store::{ApproxDistribution, Compressed, XArray, XLayout};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

fn compress(n_lanes: usize, n_other: usize, get: impl Fn(usize, usize) -> f32) -> Compressed {
    let mut indptr = vec![0_u64];
    let mut indices = Vec::new();
    let mut data = Vec::new();
    for lane in 0..n_lanes {
        for other in 0..n_other {
            let v = get(lane, other);
            if v != 0.0 {
                indices.push(other as u32);
                data.push(v);
            }
        }
        indptr.push(indices.len() as u64);
    }
    Compressed {
        indptr,
        indices,
        data,
    }
}

fn dense(n_obs: usize, n_var: usize, values: Vec<f32>) -> XArray {
    XArray {
        n_obs,
        n_var,
        tile_extent: [n_obs.max(1), 2],
        layout: XLayout::Dense(values),
    }
}

fn sparse(n_obs: usize, n_var: usize, values: &[f32], with_csc: bool) -> XArray {
    let rows = compress(n_obs, n_var, |r, c| values[r * n_var + c]);
    let cols = with_csc.then(|| compress(n_var, n_obs, |c, r| values[r * n_var + c]));
    XArray {
        n_obs,
        n_var,
        tile_extent: [n_obs.max(1), 2],
        layout: XLayout::Sparse { rows, cols },
    }
}

/// Small band target so even tiny matrices split into several bands.
fn engine(max_workers: usize) -> DiffexEngine {
    DiffexEngine::new(DiffexConfig {
        max_workers,
        cpu_multiplier: 4,
        target_work_unit: 16,
    })
}

fn run(x: &XArray, a: &[usize], b: &[usize], top_n: usize, cutoff: f64) -> DiffexResult {
    engine(4)
        .run(
            x,
            ApproxDistribution::Normal,
            &DiffexRequest {
                set_a: a,
                set_b: b,
                top_n,
                lfc_cutoff: cutoff,
            },
            &AtomicBool::new(false),
        )
        .expect("diffex")
}

fn by_var(rows: &[DiffexRow]) -> BTreeMap<u32, DiffexRow> {
    rows.iter().map(|r| (r.var_index, *r)).collect()
}

fn matrix() -> impl Strategy<Value = (usize, usize, Vec<f32>)> {
    (4_usize..12, 1_usize..9).prop_flat_map(|(n_obs, n_var)| {
        (
            Just(n_obs),
            Just(n_var),
            prop::collection::vec(prop_oneof![3 => Just(0.0_f32), 2 => 0.0_f32..20.0], n_obs * n_var),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn swapping_sets_negates_scores_and_keeps_p_values((n_obs, n_var, values) in matrix()) {
        let x = dense(n_obs, n_var, values);
        let half = n_obs / 2;
        let a: Vec<usize> = (0..half).collect();
        let b: Vec<usize> = (half..n_obs).collect();
        let forward = run(&x, &a, &b, n_var, 0.0);
        let backward = run(&x, &b, &a, n_var, 0.0);
        let fwd = by_var(&forward.positive);
        let bwd = by_var(&backward.positive);
        prop_assert_eq!(fwd.len(), n_var);
        for (var, row) in &fwd {
            let other = bwd[var];
            prop_assert!((row.log_fold_change + other.log_fold_change).abs() < 1e-9);
            prop_assert!(row.t_score == -other.t_score || (row.t_score + other.t_score).abs() < 1e-9);
            prop_assert!((row.p_value - other.p_value).abs() < 1e-9);
        }
    }

    #[test]
    fn sparse_layouts_agree_with_dense((n_obs, n_var, values) in matrix()) {
        let half = n_obs / 2;
        let a: Vec<usize> = (0..half).collect();
        let b: Vec<usize> = (half..n_obs).collect();
        let expected = by_var(&run(&dense(n_obs, n_var, values.clone()), &a, &b, n_var, 0.0).positive);
        for with_csc in [false, true] {
            let got = by_var(&run(&sparse(n_obs, n_var, &values, with_csc), &a, &b, n_var, 0.0).positive);
            for (var, row) in &expected {
                prop_assert!((row.log_fold_change - got[var].log_fold_change).abs() < 1e-6);
                prop_assert!((row.t_score - got[var].t_score).abs() < 1e-4 * row.t_score.abs().max(1.0));
            }
        }
    }

    #[test]
    fn returned_rows_clear_cutoff_unless_fallback((n_obs, n_var, values) in matrix(), top_n in 1_usize..4) {
        let x = dense(n_obs, n_var, values);
        let a: Vec<usize> = (0..n_obs / 2).collect();
        let b: Vec<usize> = (n_obs / 2..n_obs).collect();
        let result = run(&x, &a, &b, top_n, 0.5);
        prop_assert!(result.positive.len() <= top_n);
        prop_assert_eq!(result.positive.len(), result.negative.len());
        if !result.lfc_fallback {
            for row in result.positive.iter().chain(&result.negative) {
                prop_assert!(row.log_fold_change.abs() > 0.5);
            }
        }
        prop_assert!(result.positive.windows(2).all(|w| w[0].t_score >= w[1].t_score));
        prop_assert!(result.negative.windows(2).all(|w| w[0].t_score <= w[1].t_score));
    }
}

#[test]
fn single_worker_runs_are_bit_identical() {
    let (n_obs, n_var) = (40, 30);
    let values: Vec<f32> = (0..n_obs * n_var)
        .map(|i| ((i * 7919) % 13) as f32 * 0.37)
        .collect();
    let x = sparse(n_obs, n_var, &values, true);
    let a: Vec<usize> = (0..n_obs).step_by(2).collect();
    let b: Vec<usize> = (1..n_obs).step_by(2).collect();
    let req = DiffexRequest {
        set_a: &a,
        set_b: &b,
        top_n: 5,
        lfc_cutoff: 0.01,
    };
    let cancel = AtomicBool::new(false);
    let first = engine(1)
        .run(&x, ApproxDistribution::Count, &req, &cancel)
        .expect("first");
    let second = engine(1)
        .run(&x, ApproxDistribution::Count, &req, &cancel)
        .expect("second");
    assert_eq!(first, second);
    let parallel = engine(8)
        .run(&x, ApproxDistribution::Count, &req, &cancel)
        .expect("parallel");
    assert_eq!(first, parallel);
}

#[test]
fn clearly_separated_gene_ranks_first() {
    let (n_obs, n_var) = (10, 4);
    let mut values = vec![1.0_f32; n_obs * n_var];
    for r in 0..5 {
        values[r * n_var + 2] = 9.0 + r as f32 * 0.1;
        values[(r + 5) * n_var + 3] = 9.0 + r as f32 * 0.1;
    }
    for (i, v) in values.iter_mut().enumerate() {
        *v += (i % 3) as f32 * 0.01;
    }
    let x = dense(n_obs, n_var, values);
    let a: Vec<usize> = (0..5).collect();
    let b: Vec<usize> = (5..10).collect();
    let result = run(&x, &a, &b, 1, 0.01);
    assert_eq!(result.positive[0].var_index, 2);
    assert_eq!(result.negative[0].var_index, 3);
    assert!(result.positive[0].p_value < 1e-6);
    assert!(result.positive[0].p_value_adj <= 1.0);
}

#[test]
fn repeated_set_members_count_once_in_every_layout() {
    let (n_obs, n_var) = (6, 2);
    let values = vec![
        1.0, 0.0, //
        2.0, 3.0, //
        0.0, 1.0, //
        4.0, 5.0, //
        0.0, 2.0, //
        1.0, 6.0,
    ];
    let repeated = [0, 0, 0, 1];
    let b = [3, 4, 5];
    let expected = by_var(&run(&dense(n_obs, n_var, values.clone()), &[0, 1], &b, n_var, 0.0).positive);
    let layouts = [
        dense(n_obs, n_var, values.clone()),
        sparse(n_obs, n_var, &values, false),
        sparse(n_obs, n_var, &values, true),
    ];
    for x in &layouts {
        let got = by_var(&run(x, &repeated, &b, n_var, 0.0).positive);
        for (var, row) in &expected {
            assert!((row.log_fold_change - got[var].log_fold_change).abs() < 1e-9);
            assert!((row.p_value - got[var].p_value).abs() < 1e-9);
        }
    }
}

#[test]
fn cancelled_run_starts_no_band() {
    let x = dense(4, 4, vec![1.0; 16]);
    let err = engine(2)
        .run(
            &x,
            ApproxDistribution::Normal,
            &DiffexRequest {
                set_a: &[0, 1],
                set_b: &[2, 3],
                top_n: 2,
                lfc_cutoff: 0.0,
            },
            &AtomicBool::new(true),
        )
        .expect_err("cancelled");
    assert_eq!(err.code(), "ComputeError");
}

#[test]
fn out_of_range_set_member_is_a_filter_error() {
    let x = dense(4, 4, vec![1.0; 16]);
    let err = engine(2)
        .run(
            &x,
            ApproxDistribution::Normal,
            &DiffexRequest {
                set_a: &[0, 9],
                set_b: &[2, 3],
                top_n: 2,
                lfc_cutoff: 0.0,
            },
            &AtomicBool::new(false),
        )
        .expect_err("bad index");
    assert_eq!(err.code(), "FilterError");
}
