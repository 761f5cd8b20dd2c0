//! HTTP boundary: `POST /colorize` and `GET /health`.

mod error;
mod handlers;

pub use error::AppError;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::pipeline::Colorizer;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

/// Default upload limit (20 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub struct AppState {
    pub colorizer: Colorizer,
}

/// Settings for the HTTP boundary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Allowed CORS origins; `*` allows any.
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            allowed_origins: vec!["*".to_string()],
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    cors.allow_origin(origins)
}

/// Build the application router.
pub fn router(colorizer: Colorizer, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState { colorizer });

    Router::new()
        .route("/colorize", post(handlers::colorize))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.allowed_origins))
        .with_state(state)
}

/// Serve until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(colorizer: Colorizer, config: ServerConfig) -> std::io::Result<()> {
    let app = router(colorizer, &config);

    tracing::info!("Starting server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use ndarray::ArrayD;

    use super::*;
    use crate::model::{ColorizationNet, Init, LoadStatus, ParameterSource, RandomSource};

    const BOUNDARY: &str = "colorizer-test-boundary";

    /// Random parameters with a NaN output bias, so every prediction fails.
    struct PoisonedHead(RandomSource);

    impl ParameterSource for PoisonedHead {
        fn tensor(
            &mut self,
            name: &str,
            shape: &[usize],
            init: Init,
        ) -> crate::Result<ArrayD<f32>> {
            let tensor = self.0.tensor(name, shape, init)?;
            if name == "out_conv.bias" {
                return Ok(tensor.mapv(|_| f32::NAN));
            }
            Ok(tensor)
        }
    }

    fn app_with(net: ColorizationNet) -> Router {
        let status = LoadStatus::Missing {
            path: "absent.safetensors".into(),
        };
        let colorizer = Colorizer::with_model(net, status, 16).unwrap();
        router(colorizer, &ServerConfig::default())
    }

    fn app() -> Router {
        app_with(ColorizationNet::random(2, Some(0)).unwrap())
    }

    fn multipart_request(name: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; \
             filename=\"upload\"\r\n\
             Content-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/colorize")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        ::image::DynamicImage::new_luma8(width, height)
            .write_to(&mut std::io::Cursor::new(&mut buf), ::image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_colorize_returns_png_of_same_size() {
        let response = app()
            .oneshot(multipart_request("file", "image/png", &png(21, 13)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/png");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let img = ::image::load_from_memory(&body).unwrap();
        assert_eq!((img.width(), img.height()), (21, 13));
    }

    #[tokio::test]
    async fn test_non_image_content_type_rejected() {
        let response = app()
            .oneshot(multipart_request("file", "text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_undecodable_image_rejected() {
        let response = app()
            .oneshot(multipart_request("file", "image/png", b"not a png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inference_failure_hides_cause() {
        let mut source = PoisonedHead(RandomSource::new(Some(0)));
        let net = ColorizationNet::load(&mut source, 2).unwrap();
        let response = app_with(net)
            .oneshot(multipart_request("file", "image/png", &png(16, 16)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "INTERNAL_ERROR");
        assert_eq!(json["detail"], "Internal error: Colorization failed");
        assert!(!String::from_utf8_lossy(&body).contains("non-finite"));
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let response = app()
            .oneshot(multipart_request("other", "image/png", &png(4, 4)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_model_status() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["modelLoaded"], false);
        assert_eq!(json["imageSize"], 16);
    }
}
