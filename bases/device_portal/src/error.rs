//! Portal error types
//!
//! Handlers return [`PortalError`]; it renders itself as an HTTP response.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("failed to render template: {0}")]
    Template(#[from] askama::Error),

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error")]
    Serve(#[source] std::io::Error),
}

impl PortalError {
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        PortalError::Bind {
            addr: addr.into(),
            source,
        }
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        tracing::error!("Request failed: {}", self);

        let body = format!(
            r#"<!DOCTYPE html>
            <html>
            <head><title>Error</title></head>
            <body>
                <h1>Error</h1>
                <p>{}</p>
                <a href="/">Back to portal</a>
            </body>
            </html>"#,
            self
        );

        (StatusCode::INTERNAL_SERVER_ERROR, Html(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PortalError>;
