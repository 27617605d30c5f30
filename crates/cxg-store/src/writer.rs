// SPDX-License-Identifier: Apache-2.0

use crate::array::{to_banded, Compressed};
use crate::backend::GROUP_INDEX;
use crate::error::{StoreError, StoreErrorCode};
use crate::meta::{
    ApproxDistribution, ArrayEncoding, ArrayMeta, AttrDtype, AttrMeta, CategoryColors,
    CxgProperties, DataFrameMeta, GeneSet, GroupIndex, GroupMetadata, SchemaHint, ARRAY_META,
    CXG_VERSION, DATAFRAME_META, GENESETS, GROUP_METADATA,
};
use crate::schema::Axis;
use cxg_codec::{encode_matrix, Column, Matrix};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

struct PendingFrame {
    index: Option<String>,
    columns: Vec<(AttrMeta, Column)>,
}

impl PendingFrame {
    fn new() -> Self {
        Self {
            index: None,
            columns: Vec::new(),
        }
    }
}

/// Builds a matrix store on the local filesystem.
pub struct CxgWriter {
    root: PathBuf,
    n_obs: usize,
    n_var: usize,
    x: Vec<f32>,
    sparse: bool,
    tile_extent: [usize; 2],
    properties: CxgProperties,
    corpora: Option<Value>,
    colors: Option<CategoryColors>,
    genesets: Option<Vec<GeneSet>>,
    obs: PendingFrame,
    var: PendingFrame,
    embeddings: Vec<(String, usize, Vec<f32>)>,
}

fn dtype_of(column: &Column) -> Result<AttrDtype, StoreError> {
    Ok(match column {
        Column::Float32(_) => AttrDtype::Float32,
        Column::Float64(_) => AttrDtype::Float64,
        Column::Int32(_) => AttrDtype::Int32,
        Column::Int64(_) => AttrDtype::Int64,
        Column::UInt32(_) => AttrDtype::Uint32,
        Column::Bool(_) => AttrDtype::Bool,
        Column::Categorical { .. } => AttrDtype::Categorical,
        Column::Strings(_) => AttrDtype::String,
        _ => {
            return Err(StoreError::new(
                StoreErrorCode::Unsupported,
                "annotation columns must be dense",
            ))
        }
    })
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |e| StoreError::new(StoreErrorCode::Io, format!("{}: {e}", path.display()))
}

impl CxgWriter {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, n_obs: usize, n_var: usize) -> Self {
        Self {
            root: root.into(),
            n_obs,
            n_var,
            x: vec![0.0; n_obs * n_var],
            sparse: false,
            tile_extent: [n_obs.clamp(1, 1024), n_var.clamp(1, 64)],
            properties: CxgProperties::default(),
            corpora: None,
            colors: None,
            genesets: None,
            obs: PendingFrame::new(),
            var: PendingFrame::new(),
            embeddings: Vec::new(),
        }
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.properties.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn about(mut self, about: impl Into<String>) -> Self {
        self.properties.about = Some(about.into());
        self
    }

    #[must_use]
    pub fn distribution(mut self, distribution: ApproxDistribution) -> Self {
        self.properties.x_approximate_distribution = Some(distribution);
        self
    }

    #[must_use]
    pub fn corpora(mut self, corpora: Value) -> Self {
        self.corpora = Some(corpora);
        self
    }

    #[must_use]
    pub fn colors(mut self, colors: CategoryColors) -> Self {
        self.colors = Some(colors);
        self
    }

    #[must_use]
    pub fn genesets(mut self, genesets: Vec<GeneSet>) -> Self {
        self.genesets = Some(genesets);
        self
    }

    #[must_use]
    pub fn tile_extent(mut self, extent: [usize; 2]) -> Self {
        self.tile_extent = [extent[0].max(1), extent[1].max(1)];
        self
    }

    /// Row-major expression values, `n_obs * n_var` long.
    #[must_use]
    pub fn x(mut self, data: Vec<f32>) -> Self {
        self.x = data;
        self
    }

    /// Store X as CSR with a CSC mirror instead of a dense array.
    #[must_use]
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    fn frame_mut(&mut self, axis: Axis) -> &mut PendingFrame {
        match axis {
            Axis::Obs => &mut self.obs,
            Axis::Var => &mut self.var,
        }
    }

    pub fn column(
        mut self,
        axis: Axis,
        name: &str,
        column: Column,
        hint: Option<SchemaHint>,
    ) -> Result<Self, StoreError> {
        let dtype = dtype_of(&column)?;
        let frame = self.frame_mut(axis);
        let file = format!("{}.cxgm", frame.columns.len());
        frame.columns.push((
            AttrMeta {
                name: name.to_string(),
                dtype,
                file,
                schema_hint: hint,
            },
            column,
        ));
        Ok(self)
    }

    pub fn obs_column(self, name: &str, column: Column) -> Result<Self, StoreError> {
        self.column(Axis::Obs, name, column, None)
    }

    pub fn var_column(self, name: &str, column: Column) -> Result<Self, StoreError> {
        self.column(Axis::Var, name, column, None)
    }

    /// Names the index column of an axis. Defaults to the first column.
    #[must_use]
    pub fn index(mut self, axis: Axis, name: &str) -> Self {
        self.frame_mut(axis).index = Some(name.to_string());
        self
    }

    /// Row-major `n_obs x dims` coordinates.
    #[must_use]
    pub fn embedding(mut self, name: &str, dims: usize, data: Vec<f32>) -> Self {
        self.embeddings.push((name.to_string(), dims, data));
        self
    }

    pub fn write(self) -> Result<PathBuf, StoreError> {
        if self.x.len() != self.n_obs * self.n_var {
            return Err(StoreError::validation(format!(
                "X has {} values for shape {}x{}",
                self.x.len(),
                self.n_obs,
                self.n_var
            )));
        }
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

        let mut members = vec!["X".to_string(), "obs".to_string(), "var".to_string()];
        self.write_x()?;
        if self.sparse {
            members.push("Xc".to_string());
        }
        write_frame(&self.root.join("obs"), &self.obs, self.n_obs)?;
        write_frame(&self.root.join("var"), &self.var, self.n_var)?;

        if !self.embeddings.is_empty() {
            members.push("emb".to_string());
            let emb = self.root.join("emb");
            let mut names = Vec::new();
            for (name, dims, data) in &self.embeddings {
                if *dims < 2 || data.len() != self.n_obs * dims {
                    return Err(StoreError::validation(format!(
                        "embedding {name} must be {} x d with d >= 2",
                        self.n_obs
                    )));
                }
                let dir = emb.join(name);
                write_json(
                    &dir.join(ARRAY_META),
                    &ArrayMeta {
                        shape: [self.n_obs, *dims],
                        tile_extent: [self.n_obs.max(1), *dims],
                        encoding: ArrayEncoding::Dense,
                        dtype: "float32".to_string(),
                    },
                )?;
                write_bin(&dir.join("data.bin"), &f32_bytes(data))?;
                names.push(name.clone());
            }
            write_json(&emb.join(GROUP_INDEX), &GroupIndex { members: names })?;
        }

        if let Some(genesets) = &self.genesets {
            write_json(&self.root.join(GENESETS), genesets)?;
        }
        write_json(&self.root.join(GROUP_INDEX), &GroupIndex { members })?;
        write_json(
            &self.root.join(GROUP_METADATA),
            &GroupMetadata {
                cxg_version: CXG_VERSION.to_string(),
                cxg_properties: self.properties.clone(),
                corpora: self.corpora.clone(),
                cxg_category_colors: self.colors.clone(),
            },
        )?;
        Ok(self.root)
    }

    fn write_x(&self) -> Result<(), StoreError> {
        let shape = [self.n_obs, self.n_var];
        let x_dir = self.root.join("X");
        if !self.sparse {
            write_json(
                &x_dir.join(ARRAY_META),
                &ArrayMeta {
                    shape,
                    tile_extent: self.tile_extent,
                    encoding: ArrayEncoding::Dense,
                    dtype: "float32".to_string(),
                },
            )?;
            let banded = to_banded(&self.x, self.n_obs, self.n_var, self.tile_extent[1]);
            return write_bin(&x_dir.join("data.bin"), &f32_bytes(&banded));
        }
        for (dir, encoding, by_col) in [
            (x_dir, ArrayEncoding::Csr, false),
            (self.root.join("Xc"), ArrayEncoding::Csc, true),
        ] {
            write_json(
                &dir.join(ARRAY_META),
                &ArrayMeta {
                    shape,
                    tile_extent: self.tile_extent,
                    encoding,
                    dtype: "float32".to_string(),
                },
            )?;
            let c = compress(&self.x, self.n_obs, self.n_var, by_col);
            let indptr: Vec<u8> = c.indptr.iter().flat_map(|v| v.to_le_bytes()).collect();
            let indices: Vec<u8> = c.indices.iter().flat_map(|v| v.to_le_bytes()).collect();
            write_bin(&dir.join("indptr.bin"), &indptr)?;
            write_bin(&dir.join("indices.bin"), &indices)?;
            write_bin(&dir.join("data.bin"), &f32_bytes(&c.data))?;
        }
        Ok(())
    }
}

fn compress(dense: &[f32], n_rows: usize, n_cols: usize, by_col: bool) -> Compressed {
    let (lanes, minor) = if by_col {
        (n_cols, n_rows)
    } else {
        (n_rows, n_cols)
    };
    let mut out = Compressed {
        indptr: Vec::with_capacity(lanes + 1),
        indices: Vec::new(),
        data: Vec::new(),
    };
    out.indptr.push(0);
    for lane in 0..lanes {
        for m in 0..minor {
            let v = if by_col {
                dense[m * n_cols + lane]
            } else {
                dense[lane * n_cols + m]
            };
            if v != 0.0 {
                out.indices.push(m as u32);
                out.data.push(v);
            }
        }
        out.indptr.push(out.data.len() as u64);
    }
    out
}

fn write_frame(dir: &Path, frame: &PendingFrame, nrows: usize) -> Result<(), StoreError> {
    let first = frame
        .columns
        .first()
        .map(|(a, _)| a.name.clone())
        .ok_or_else(|| StoreError::validation(format!("{} has no columns", dir.display())))?;
    let index = frame.index.clone().unwrap_or(first);
    for (attr, column) in &frame.columns {
        if column.len() != nrows {
            return Err(StoreError::validation(format!(
                "column {} has {} rows, expected {nrows}",
                attr.name,
                column.len()
            )));
        }
        let bytes = encode_matrix(&Matrix::new(nrows, vec![column.clone()]))?;
        write_bin(&dir.join(&attr.file), &bytes)?;
    }
    write_json(
        &dir.join(DATAFRAME_META),
        &DataFrameMeta {
            index,
            nrows,
            attributes: frame.columns.iter().map(|(a, _)| a.clone()).collect(),
        },
    )
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn write_bin(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::write(path, bytes).map_err(io_err(path))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bin(path, &bytes)
}
