#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// Invitations accepted by `POST /api/solicitudes/invitar-top3` before it starts answering 409.
pub const CUPOS: usize = 3;

#[derive(Clone, Default)]
struct Target {
    invitados: Arc<AtomicUsize>,
    pagos: Arc<AtomicUsize>,
}

async fn top3() -> Json<Value> {
    Json(json!([
        {"id": 1, "nombre": "Ana"},
        {"id": 2, "nombre": "Luis"},
        {"id": 3, "nombre": "Sofía"}
    ]))
}

async fn invitar(State(target): State<Target>) -> (StatusCode, Json<Value>) {
    let n = target.invitados.fetch_add(1, Ordering::SeqCst);
    if n < CUPOS {
        (StatusCode::CREATED, Json(json!({"id": n + 1, "estado": "INVITADO"})))
    } else {
        (StatusCode::CONFLICT, Json(json!({"error": "top3 completo"})))
    }
}

async fn crear_pago(State(target): State<Target>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match body["monto"].as_f64() {
        Some(monto) if monto > 0.0 => {
            let id = target.pagos.fetch_add(1, Ordering::SeqCst) + 1;
            (StatusCode::CREATED, Json(json!({"id": id, "monto": monto, "estado": "PENDIENTE"})))
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({"error": "monto invalido"}))),
    }
}

async fn echo_trace(headers: HeaderMap) -> (HeaderMap, &'static str) {
    let mut out = HeaderMap::new();
    if let Some(trace) = headers.get("x-trace") {
        out.insert("x-echo-trace", trace.clone());
    }
    (out, "ok")
}

async fn boom() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(500)).await;
    "late"
}

/// Serve the fake target on an ephemeral port and return its base URL.
pub async fn spawn_target() -> String {
    let app = Router::new()
        .route("/api/invitaciones/top3", get(top3))
        .route("/api/solicitudes/invitar-top3", post(invitar))
        .route("/api/pagos", post(crear_pago))
        .route("/api/echo", get(echo_trace))
        .route("/api/boom", get(boom))
        .route("/api/slow", get(slow))
        .with_state(Target::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
