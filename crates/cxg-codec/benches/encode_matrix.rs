// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cxg_codec::{decode_matrix, encode_matrix, encode_matrix_with, Column, EncodeOptions, Matrix};

fn expression_slice(n_rows: usize, n_cols: usize) -> Matrix {
    let columns = (0..n_cols)
        .map(|c| {
            Column::Float32(
                (0..n_rows)
                    .map(|r| if (r + c) % 7 == 0 { (r % 13) as f32 * 0.25 } else { 0.0 })
                    .collect(),
            )
        })
        .collect();
    Matrix::new(n_rows, columns).with_col_index(Column::Int32((0..n_cols as i32).collect()))
}

fn bench_encode(c: &mut Criterion) {
    let m = expression_slice(50_000, 8);
    c.bench_function("encode_dense_50k_x8", |b| {
        b.iter(|| encode_matrix(black_box(&m)).expect("encode"))
    });
    let opts = EncodeOptions {
        sparse_threshold: Some(0.25),
    };
    c.bench_function("encode_sparse_50k_x8", |b| {
        b.iter(|| encode_matrix_with(black_box(&m), opts).expect("encode"))
    });
    let bytes = encode_matrix(&m).expect("encode");
    c.bench_function("decode_dense_50k_x8", |b| {
        b.iter(|| decode_matrix(black_box(&bytes)).expect("decode"))
    });
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
