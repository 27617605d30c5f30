// SPDX-License-Identifier: Apache-2.0

use crate::array::{
    band_columns, load_dense, load_x, positions, read_array_meta, read_dense_band, read_indptr,
    read_lane, DenseBlock, XArray,
};
use crate::backend::{StorageBackend, GROUP_INDEX};
use crate::context::StoreContext;
use crate::dataframe::{bool_as_categorical, read_attribute, read_dataframe_meta, unknown_name};
use crate::error::{StoreError, StoreErrorCode};
use crate::meta::{
    ApproxDistribution, ArrayEncoding, ArrayMeta, AttrDtype, CategoryColors, DataFrameMeta, GeneSet,
    GroupMetadata, ARRAY_META, GENESETS, GROUP_METADATA,
};
use crate::schema::{
    column_schema, AnnotationsSchema, Axis, AxisSchema, DataframeSchema, EmbeddingSchema,
    LayoutSchema, Schema,
};
use cxg_codec::Column;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptorOptions {
    /// Categorical columns with more categories are presented as strings.
    pub max_categories: usize,
}

impl Default for AdaptorOptions {
    fn default() -> Self {
        Self {
            max_categories: 1000,
        }
    }
}

type Lane = (Vec<u32>, Vec<f32>);

/// Pieces of X read for narrow column requests.
#[derive(Default)]
struct XParts {
    bands: HashMap<usize, Arc<Vec<f32>>>,
    csc_indptr: Option<Arc<Vec<u64>>>,
    lanes: HashMap<usize, Arc<Lane>>,
}

/// An opened matrix store.
///
/// Sidecar metadata is read at open. Arrays, embeddings and annotation columns
/// are read on first use and kept until [`CxgAdaptor::close`]. Requests for a
/// few columns read only the dense bands or CSC lanes holding them.
pub struct CxgAdaptor {
    uri: String,
    backend: Arc<dyn StorageBackend>,
    options: AdaptorOptions,
    group: GroupMetadata,
    x_meta: ArrayMeta,
    /// Whether a sparse X has its `Xc` column mirror.
    x_mirror: bool,
    obs: DataFrameMeta,
    var: DataFrameMeta,
    embeddings: Vec<String>,
    x: Mutex<Option<Arc<XArray>>>,
    x_parts: Mutex<XParts>,
    emb: Mutex<HashMap<String, Arc<DenseBlock>>>,
    columns: Mutex<HashMap<(Axis, String), Arc<Column>>>,
    schema: Mutex<Option<Arc<Schema>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CxgAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CxgAdaptor")
            .field("uri", &self.uri)
            .field("shape", &self.shape())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock()
        .map_err(|_| StoreError::new(StoreErrorCode::Io, "adaptor cache lock poisoned"))
}

impl CxgAdaptor {
    pub fn open(
        context: &StoreContext,
        uri: &str,
        options: AdaptorOptions,
    ) -> Result<Self, StoreError> {
        let started = Instant::now();
        tracing::info!(uri, "dataset open start");
        let backend = context.backend_for(uri)?;
        if !backend.exists(GROUP_METADATA)? {
            return Err(StoreError::not_found(format!("no matrix store at {uri}")));
        }
        let group: GroupMetadata = serde_json::from_slice(&backend.read(GROUP_METADATA)?)?;
        let x_meta = read_array_meta(backend.as_ref(), "X")?;
        let [n_obs, n_var] = x_meta.shape;
        let obs = read_dataframe_meta(backend.as_ref(), "obs")?;
        let var = read_dataframe_meta(backend.as_ref(), "var")?;
        if obs.nrows != n_obs || var.nrows != n_var {
            return Err(StoreError::validation(format!(
                "{uri}: annotation lengths ({}, {}) disagree with X shape ({n_obs}, {n_var})",
                obs.nrows, var.nrows
            )));
        }
        let x_mirror = x_meta.encoding == ArrayEncoding::Csr
            && backend.exists(&format!("Xc/{ARRAY_META}"))?;
        if x_mirror {
            let cmeta = read_array_meta(backend.as_ref(), "Xc")?;
            if cmeta.encoding != ArrayEncoding::Csc || cmeta.shape != x_meta.shape {
                return Err(StoreError::validation("Xc does not mirror X"));
            }
        }
        let embeddings = if backend.exists(&format!("emb/{GROUP_INDEX}"))? {
            backend.list("emb")?
        } else {
            Vec::new()
        };
        tracing::info!(
            uri,
            n_obs,
            n_var,
            embeddings = embeddings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dataset open complete"
        );
        Ok(Self {
            uri: uri.to_string(),
            backend,
            options,
            group,
            x_meta,
            x_mirror,
            obs,
            var,
            embeddings,
            x: Mutex::new(None),
            x_parts: Mutex::new(XParts::default()),
            emb: Mutex::new(HashMap::new()),
            columns: Mutex::new(HashMap::new()),
            schema: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::new(
                StoreErrorCode::Closed,
                format!("{} is closed", self.uri),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.x_meta.shape[0], self.x_meta.shape[1])
    }

    #[must_use]
    pub fn tile_extent(&self) -> [usize; 2] {
        self.x_meta.tile_extent
    }

    #[must_use]
    pub fn cxg_version(&self) -> &str {
        &self.group.cxg_version
    }

    #[must_use]
    pub fn approx_distribution(&self) -> ApproxDistribution {
        self.group
            .cxg_properties
            .x_approximate_distribution
            .unwrap_or_default()
    }

    /// Dataset title, falling back to the store's base name.
    #[must_use]
    pub fn title(&self) -> String {
        self.group.cxg_properties.title.clone().unwrap_or_else(|| {
            let trimmed = self.uri.trim_end_matches('/');
            let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
            base.strip_suffix(".cxg").unwrap_or(base).to_string()
        })
    }

    #[must_use]
    pub fn about(&self) -> Option<&str> {
        self.group.cxg_properties.about.as_deref()
    }

    #[must_use]
    pub fn corpora(&self) -> Option<&Value> {
        self.group.corpora.as_ref()
    }

    #[must_use]
    pub fn colors(&self) -> CategoryColors {
        self.group.cxg_category_colors.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn obs_keys(&self) -> Vec<String> {
        self.obs.keys()
    }

    #[must_use]
    pub fn var_keys(&self) -> Vec<String> {
        self.var.keys()
    }

    #[must_use]
    pub fn index_name(&self, axis: Axis) -> &str {
        match axis {
            Axis::Obs => &self.obs.index,
            Axis::Var => &self.var.index,
        }
    }

    #[must_use]
    pub fn has_column(&self, axis: Axis, name: &str) -> bool {
        self.frame(axis).attribute(name).is_some()
    }

    #[must_use]
    pub fn embedding_names(&self) -> &[String] {
        &self.embeddings
    }

    fn frame(&self, axis: Axis) -> &DataFrameMeta {
        match axis {
            Axis::Obs => &self.obs,
            Axis::Var => &self.var,
        }
    }

    /// One annotation column. Boolean obs columns come back categorical.
    pub fn query(&self, axis: Axis, name: &str) -> Result<Arc<Column>, StoreError> {
        self.ensure_open()?;
        let key = (axis, name.to_string());
        if let Some(hit) = lock(&self.columns)?.get(&key) {
            return Ok(Arc::clone(hit));
        }
        let frame = self.frame(axis);
        let attr = frame
            .attribute(name)
            .ok_or_else(|| unknown_name(axis.as_str(), name))?;
        let mut column = read_attribute(self.backend.as_ref(), axis.as_str(), frame, attr)?;
        if axis == Axis::Obs {
            column = bool_as_categorical(column);
        }
        let column = Arc::new(column);
        lock(&self.columns)?.insert(key, Arc::clone(&column));
        Ok(column)
    }

    pub fn query_obs(&self, name: &str) -> Result<Arc<Column>, StoreError> {
        self.query(Axis::Obs, name)
    }

    pub fn query_var(&self, name: &str) -> Result<Arc<Column>, StoreError> {
        self.query(Axis::Var, name)
    }

    pub fn x(&self) -> Result<Arc<XArray>, StoreError> {
        self.ensure_open()?;
        let mut slot = lock(&self.x)?;
        if let Some(x) = slot.as_ref() {
            return Ok(Arc::clone(x));
        }
        let started = Instant::now();
        let x = Arc::new(load_x(self.backend.as_ref())?);
        tracing::debug!(
            uri = %self.uri,
            sparse = x.is_sparse(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "X loaded"
        );
        *slot = Some(Arc::clone(&x));
        Ok(x)
    }

    /// Dense sub-matrix selected by one boolean mask per axis (`None` selects
    /// the whole axis).
    pub fn x_slice(
        &self,
        obs_mask: Option<&[bool]>,
        var_mask: Option<&[bool]>,
    ) -> Result<DenseBlock, StoreError> {
        let (n_obs, n_var) = self.shape();
        let rows = mask_indices(obs_mask, n_obs, "obs")?;
        let cols = mask_indices(var_mask, n_var, "var")?;
        self.x_slice_indices(&rows, &cols)
    }

    pub fn x_slice_indices(&self, rows: &[usize], cols: &[usize]) -> Result<DenseBlock, StoreError> {
        self.ensure_open()?;
        let (n_obs, n_var) = self.shape();
        if rows.iter().any(|r| *r >= n_obs) || cols.iter().any(|c| *c >= n_var) {
            return Err(StoreError::validation("slice index out of range"));
        }
        let loaded = lock(&self.x)?.clone();
        if let Some(x) = loaded {
            return Ok(x.slice(rows, cols));
        }
        if rows.is_empty() || cols.is_empty() {
            return Ok(DenseBlock::zeros(rows.len(), cols.len()));
        }
        // wide requests are cheaper from the whole matrix
        if cols.len() * 2 > n_var {
            return Ok(self.x()?.slice(rows, cols));
        }
        match self.x_meta.encoding {
            ArrayEncoding::Dense => self.slice_bands(rows, cols),
            ArrayEncoding::Csr if self.x_mirror => self.slice_lanes(rows, cols),
            _ => Ok(self.x()?.slice(rows, cols)),
        }
    }

    fn dense_band(&self, band: usize) -> Result<Arc<Vec<f32>>, StoreError> {
        if let Some(hit) = lock(&self.x_parts)?.bands.get(&band) {
            return Ok(Arc::clone(hit));
        }
        let values = Arc::new(read_dense_band(
            self.backend.as_ref(),
            "X",
            &self.x_meta,
            band,
        )?);
        tracing::debug!(uri = %self.uri, band, "X band read");
        lock(&self.x_parts)?
            .bands
            .insert(band, Arc::clone(&values));
        Ok(values)
    }

    fn slice_bands(&self, rows: &[usize], cols: &[usize]) -> Result<DenseBlock, StoreError> {
        let (_, n_var) = self.shape();
        let w = self.x_meta.tile_extent[1].max(1);
        let mut out = DenseBlock::zeros(rows.len(), cols.len());
        for (q, c) in cols.iter().enumerate() {
            let band = c / w;
            let span = band_columns(band, w, n_var);
            let values = self.dense_band(band)?;
            for (p, r) in rows.iter().enumerate() {
                out.data[p * out.n_cols + q] = values[r * span.len() + (c - span.start)];
            }
        }
        Ok(out)
    }

    fn csc_lane(&self, col: usize) -> Result<Arc<Lane>, StoreError> {
        let (n_obs, n_var) = self.shape();
        let indptr = {
            let mut parts = lock(&self.x_parts)?;
            if let Some(hit) = parts.lanes.get(&col) {
                return Ok(Arc::clone(hit));
            }
            match &parts.csc_indptr {
                Some(indptr) => Arc::clone(indptr),
                None => {
                    let indptr = Arc::new(read_indptr(self.backend.as_ref(), "Xc", n_var)?);
                    parts.csc_indptr = Some(Arc::clone(&indptr));
                    indptr
                }
            }
        };
        let lane = Arc::new(read_lane(self.backend.as_ref(), "Xc", &indptr, col, n_obs)?);
        lock(&self.x_parts)?.lanes.insert(col, Arc::clone(&lane));
        Ok(lane)
    }

    fn slice_lanes(&self, rows: &[usize], cols: &[usize]) -> Result<DenseBlock, StoreError> {
        let (n_obs, _) = self.shape();
        let row_pos = positions(rows, n_obs);
        let mut out = DenseBlock::zeros(rows.len(), cols.len());
        for (q, c) in cols.iter().enumerate() {
            let lane = self.csc_lane(*c)?;
            for (r, v) in lane.0.iter().zip(&lane.1) {
                if let Some(p) = row_pos[*r as usize] {
                    out.data[p * out.n_cols + q] = *v;
                }
            }
        }
        Ok(out)
    }

    /// First `dims` coordinates of an embedding, one vector per dimension.
    pub fn embedding(&self, name: &str, dims: usize) -> Result<Vec<Vec<f32>>, StoreError> {
        self.ensure_open()?;
        if !self.embeddings.iter().any(|e| e == name) {
            return Err(unknown_name("embedding", name));
        }
        let cached = lock(&self.emb)?.get(name).cloned();
        let block = match cached {
            Some(block) => block,
            None => {
                let block = Arc::new(load_dense(self.backend.as_ref(), &format!("emb/{name}"))?);
                lock(&self.emb)?.insert(name.to_string(), Arc::clone(&block));
                block
            }
        };
        let (n_obs, _) = self.shape();
        if block.n_rows != n_obs || block.n_cols < 2 || block.n_cols < dims {
            return Err(StoreError::validation(format!(
                "embedding {name} has shape {}x{}",
                block.n_rows, block.n_cols
            )));
        }
        Ok((0..dims).map(|d| block.column(d)).collect())
    }

    pub fn genesets(&self) -> Result<Vec<GeneSet>, StoreError> {
        self.ensure_open()?;
        if !self.backend.exists(GENESETS)? {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&self.backend.read(GENESETS)?)?)
    }

    pub fn schema(&self) -> Result<Arc<Schema>, StoreError> {
        self.ensure_open()?;
        if let Some(schema) = lock(&self.schema)?.as_ref() {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(Schema {
            dataframe: DataframeSchema {
                n_obs: self.shape().0,
                n_var: self.shape().1,
                kind: self.x_meta.dtype.clone(),
            },
            annotations: AnnotationsSchema {
                obs: self.axis_schema(Axis::Obs)?,
                var: self.axis_schema(Axis::Var)?,
            },
            layout: LayoutSchema {
                obs: self
                    .embeddings
                    .iter()
                    .map(|e| EmbeddingSchema::two_dimensional(e))
                    .collect(),
            },
        });
        *lock(&self.schema)? = Some(Arc::clone(&schema));
        Ok(schema)
    }

    fn axis_schema(&self, axis: Axis) -> Result<AxisSchema, StoreError> {
        let frame = self.frame(axis);
        let mut columns = Vec::with_capacity(frame.attributes.len());
        for attr in &frame.attributes {
            let column = if attr.dtype == AttrDtype::Categorical {
                Some(self.query(axis, &attr.name)?)
            } else {
                None
            };
            let categories = match column.as_deref() {
                Some(Column::Categorical { categories, .. }) => Some(categories.as_slice()),
                _ => None,
            };
            if let Some(col) =
                column_schema(axis, attr, categories, self.options.max_categories)
            {
                columns.push(col);
            }
        }
        Ok(AxisSchema {
            columns,
            index: frame.index.clone(),
        })
    }

    /// Releases cached arrays. Further reads fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut x) = self.x.lock() {
            x.take();
        }
        if let Ok(mut parts) = self.x_parts.lock() {
            *parts = XParts::default();
        }
        if let Ok(mut emb) = self.emb.lock() {
            emb.clear();
        }
        if let Ok(mut cols) = self.columns.lock() {
            cols.clear();
        }
        tracing::debug!(uri = %self.uri, "dataset closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Positions selected by `mask`, or all positions for `None`.
pub fn mask_indices(mask: Option<&[bool]>, len: usize, axis: &str) -> Result<Vec<usize>, StoreError> {
    match mask {
        None => Ok((0..len).collect()),
        Some(m) if m.len() != len => Err(StoreError::validation(format!(
            "{axis} mask has {} entries, axis has {len}",
            m.len()
        ))),
        Some(m) => Ok(m
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect()),
    }
}
