use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{body::Bytes, Router};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::kv::{KvCommand, KvResult};
use crate::types::NodeId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ApiResponse {
    Result(KvResult),
    NotLeader(Option<NodeId>),
    Failed(String),
}

/// One pending client request: the command to run and where to send the result.
pub type Pending = (KvCommand, oneshot::Sender<ApiResponse>);

/// Serve `GET/PUT/DELETE /kv/{key}`, forwarding every request over `tx`.
pub async fn serve(addr: SocketAddr, tx: mpsc::Sender<Pending>) {
    let app = Router::new()
        .route(
            "/kv/{key}",
            get(handle_get).put(handle_put).delete(handle_delete),
        )
        .with_state(tx);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "client api bind failed");
            return;
        }
    };

    info!(%addr, "client api listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "client api server error");
    }
}

async fn handle_get(
    State(tx): State<mpsc::Sender<Pending>>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(tx, KvCommand::Get { key }).await
}

async fn handle_put(
    State(tx): State<mpsc::Sender<Pending>>,
    Path(key): Path<String>,
    body: Bytes,
) -> (StatusCode, String) {
    let value = String::from_utf8_lossy(&body).into_owned();
    submit(tx, KvCommand::Set { key, value }).await
}

async fn handle_delete(
    State(tx): State<mpsc::Sender<Pending>>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(tx, KvCommand::Delete { key }).await
}

async fn submit(tx: mpsc::Sender<Pending>, command: KvCommand) -> (StatusCode, String) {
    let (resp_tx, resp_rx) = oneshot::channel::<ApiResponse>();

    if tx.send((command, resp_tx)).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down".into());
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, resp_rx).await {
        Ok(Ok(response)) => render(response),
        Ok(Err(_)) | Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "timeout".into()),
    }
}

fn render(response: ApiResponse) -> (StatusCode, String) {
    match response {
        ApiResponse::Result(KvResult::Ok) => (StatusCode::OK, "ok".into()),
        ApiResponse::Result(KvResult::Value(Some(v))) => (StatusCode::OK, v),
        ApiResponse::Result(KvResult::Value(None)) => (StatusCode::NOT_FOUND, String::new()),
        ApiResponse::NotLeader(Some(leader)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not the leader, try {leader}"),
        ),
        ApiResponse::NotLeader(None) => (StatusCode::SERVICE_UNAVAILABLE, "not the leader".into()),
        ApiResponse::Failed(reason) => (StatusCode::INTERNAL_SERVER_ERROR, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_map_to_status_codes() {
        assert_eq!(render(ApiResponse::Result(KvResult::Ok)).0, StatusCode::OK);
        assert_eq!(
            render(ApiResponse::Result(KvResult::Value(Some("v".into())))),
            (StatusCode::OK, "v".to_string())
        );
        assert_eq!(
            render(ApiResponse::Result(KvResult::Value(None))).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            render(ApiResponse::NotLeader(Some(NodeId::from(2)))),
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "not the leader, try N2".to_string()
            )
        );
    }

    #[tokio::test]
    async fn requests_are_forwarded_and_answered() {
        let (tx, mut rx) = mpsc::channel::<Pending>(1);
        tokio::spawn(async move {
            while let Some((command, reply)) = rx.recv().await {
                let result = match command {
                    KvCommand::Get { key } => KvResult::Value(Some(key)),
                    _ => KvResult::Ok,
                };
                let _ = reply.send(ApiResponse::Result(result));
            }
        });

        let (status, body) = submit(tx.clone(), KvCommand::Get { key: "k".into() }).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "k");
    }
}
