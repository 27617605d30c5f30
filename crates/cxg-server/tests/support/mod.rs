// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use cxg_codec::Column;
use cxg_server::{build_router, AppState, DatarootConfig, ServerConfig};
use cxg_store::{
    ApproxDistribution, Axis, CategoryColors, CxgWriter, GeneSet, GeneSetGene, SchemaHint,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const N_OBS: usize = 12;
pub const N_VAR: usize = 10;
pub const GENES: [&str; N_VAR] = [
    "CD3E", "MS4A1", "NKG7", "GNLY", "CD8A", "CD8B", "LYZ", "S100A8", "PPBP", "FCGR3A",
];
pub const CLUSTERS: [&str; 3] = ["B cells", "NK cells", "CD8 T cells"];
pub const WEB_BASE: &str = "http://cells.example";

/// Four cells per cluster. NK cells express the first five genes highly,
/// CD8 T cells the last five.
pub fn expression(cell: usize, gene: usize) -> f32 {
    let jitter = (cell % 4) as f32 * 0.5;
    match (cell / 4, gene < 5) {
        (0, _) => 2.0 + gene as f32 * 0.1 + jitter,
        (1, true) | (2, false) => 10.0 + gene as f32 + jitter,
        _ => 1.0 + jitter,
    }
}

pub fn write_dataset(path: PathBuf, writable_obs: bool) -> PathBuf {
    let x = (0..N_OBS * N_VAR)
        .map(|i| expression(i / N_VAR, i % N_VAR))
        .collect();
    let mut colors: CategoryColors = BTreeMap::new();
    colors.insert(
        "louvain".to_string(),
        CLUSTERS
            .iter()
            .zip(["#1f77b4", "#ff7f0e", "#2ca02c"])
            .map(|(c, hex)| (c.to_string(), hex.to_string()))
            .collect(),
    );
    let writer = CxgWriter::new(path, N_OBS, N_VAR)
        .title("pbmc")
        .about("https://cells.example/about/pbmc")
        .distribution(ApproxDistribution::Normal)
        .x(x)
        .tile_extent([8, 4])
        .colors(colors)
        .corpora(json!({"organism": "human", "tissue": "blood"}))
        .genesets(vec![GeneSet {
            geneset_name: "nk markers".into(),
            geneset_description: "natural killer".into(),
            genes: vec![GeneSetGene {
                gene_symbol: "NKG7".into(),
                gene_description: String::new(),
            }],
        }])
        .obs_column(
            "cell",
            Column::Strings((0..N_OBS).map(|i| format!("AAAC-{i}")).collect()),
        )
        .and_then(|w| {
            w.obs_column(
                "louvain",
                Column::Categorical {
                    codes: (0..N_OBS).map(|i| (i / 4) as u32).collect(),
                    categories: CLUSTERS.iter().map(ToString::to_string).collect(),
                },
            )
        })
        .and_then(|w| {
            w.obs_column(
                "n_genes",
                Column::Int32((0..N_OBS).map(|i| 100 + i as i32).collect()),
            )
        })
        .and_then(|w| {
            w.obs_column(
                "percent_mito",
                Column::Float32((0..N_OBS).map(|i| i as f32 * 0.01).collect()),
            )
        })
        .and_then(|w| w.obs_column("is_doublet", Column::Bool(vec![false; N_OBS])))
        .and_then(|w| {
            if !writable_obs {
                return Ok(w);
            }
            w.column(
                Axis::Obs,
                "user_label",
                Column::Strings(vec![String::new(); N_OBS]),
                Some(SchemaHint {
                    kind: Some("categorical".into()),
                    writable: true,
                }),
            )
        })
        .and_then(|w| {
            w.var_column(
                "name_0",
                Column::Strings(GENES.iter().map(ToString::to_string).collect()),
            )
        })
        .and_then(|w| {
            w.var_column(
                "n_cells",
                Column::Int64((0..N_VAR).map(|i| 3 + i as i64).collect()),
            )
        })
        .expect("dataset columns");
    writer
        .index(Axis::Obs, "cell")
        .index(Axis::Var, "name_0")
        .embedding(
            "umap",
            2,
            (0..N_OBS * 2).map(|i| i as f32 * 0.25 - 1.0).collect(),
        )
        .write()
        .expect("write dataset")
}

/// Dataroot `d` over `root` with `pbmc.cxg` and `labels.cxg` (writable obs),
/// and user-scoped dataroot `u` holding `userID-7/mine.cxg`.
pub fn fixture_config(root: &Path) -> ServerConfig {
    write_dataset(root.join("d").join("pbmc.cxg"), false);
    write_dataset(root.join("d").join("labels.cxg"), true);
    write_dataset(root.join("u").join("7").join("mine.cxg"), false);

    let mut config = ServerConfig::default();
    config.dataroots.insert(
        "d".to_string(),
        DatarootConfig {
            root: root.join("d").display().to_string(),
            user_scoped: false,
        },
    );
    config.dataroots.insert(
        "u".to_string(),
        DatarootConfig {
            root: root.join("u").display().to_string(),
            user_scoped: true,
        },
    );
    config
}

pub async fn start(config: ServerConfig) -> (SocketAddr, AppState) {
    let state = AppState::new(config).expect("app state");
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move { axum::serve(listener, app).await.expect("serve app") });
    (addr, state)
}

pub async fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect server");
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (k, v) in headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    if method != "GET" {
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    req.push_str("\r\n");
    stream
        .write_all(req.as_bytes())
        .await
        .expect("write request");
    stream.write_all(body).await.expect("write body");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read response");
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("http response must have separator");
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .expect("http status");
    (status, head, response[split + 4..].to_vec())
}

pub async fn get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> (u16, String, Vec<u8>) {
    send(addr, "GET", path, headers, &[]).await
}

pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

pub fn json_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}

pub fn error_code(body: &[u8]) -> String {
    json_body(body)
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Minimal metadata service. `respond` maps the request line to a status
/// and JSON body; the returned counter tracks connections.
pub async fn stub_metadata_service<F>(respond: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0_u8; 16 * 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let line = request.lines().next().unwrap_or_default().to_string();
            let (status, body) = respond(&line);
            let reply = format!(
                "HTTP/1.1 {status} STUB\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), hits)
}
