//! Loopback HTTP front end for the CA

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::authority::{CaError, CertificateAuthority};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

fn pem_response(pem: String) -> Response {
    ([(header::CONTENT_TYPE, PEM_CONTENT_TYPE)], pem).into_response()
}

async fn sign_handler(State(ca): State<Arc<CertificateAuthority>>, body: String) -> Response {
    // Key parsing and signing are CPU bound and touch the filesystem
    let result = tokio::task::spawn_blocking(move || ca.sign_request_pem(&body)).await;

    match result {
        Ok(Ok(pem)) => pem_response(pem),
        Ok(Err(CaError::BadRequest(msg))) => {
            log::warn!("Rejected certificate request: {}", msg);
            (StatusCode::BAD_REQUEST, msg).into_response()
        }
        Ok(Err(e)) => {
            log::error!("Signing failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            log::error!("Signing task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn cacert_handler(State(ca): State<Arc<CertificateAuthority>>) -> Response {
    pem_response(ca.ca_cert_pem().to_string())
}

pub fn build_router(ca: Arc<CertificateAuthority>) -> Router {
    Router::new()
        .route("/prod", post(sign_handler))
        .route("/prod/cacert.pem", get(cacert_handler))
        .with_state(ca)
}

/// Serve the CA on `127.0.0.1:port` until `shutdown` completes
pub async fn serve<F>(ca: Arc<CertificateAuthority>, port: u16, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("CA server listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(ca))
        .with_graceful_shutdown(shutdown)
        .await
}
