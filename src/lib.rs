pub mod config;
pub mod settings;
pub mod ers; // Registry session, retry, attachment selection
pub mod pipeline; // Document extraction + reconciliation

use tracing_subscriber::EnvFilter;

use ers::{AttachmentSelector, HttpRegistrySession, WorkListFetcher};
use pipeline::extraction::Preprocessor;
use pipeline::reconcile::{BatchResult, HttpReferralStore, ReconcileError, ReconcileRunner};
use settings::ReconcileSettings;

/// Run one reconciliation batch with settings from the environment.
pub fn run() -> Result<BatchResult, ReconcileError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let settings = ReconcileSettings::load()?;
    run_with_settings(&settings)
}

/// Build the production session, store and runner from `settings` and run a batch.
pub fn run_with_settings(settings: &ReconcileSettings) -> Result<BatchResult, ReconcileError> {
    let selector = AttachmentSelector::new(&settings.supported_extensions, &settings.exclusions)?;
    let preprocessor = Preprocessor::new(settings.filters.clone(), settings.buffer_size)?;
    let runner = ReconcileRunner::new(
        selector,
        WorkListFetcher::new(settings.retry),
        settings.tolerances.clone(),
        preprocessor,
        settings.reconcile_options(),
    );

    let mut session = HttpRegistrySession::new(&settings.registry)
        .map_err(|e| ReconcileError::ClientSetup(e.to_string()))?;
    let store = HttpReferralStore::new(&settings.local_api)
        .map_err(|e| ReconcileError::ClientSetup(e.to_string()))?;

    runner.run_batch(&mut session, &store)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::mpsc;

    use axum::Router;

    /// Serve `router` on an ephemeral port from a background thread.
    /// Returns the base URL, e.g. `http://127.0.0.1:49152`.
    pub fn spawn_server(router: Router) -> String {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, router).await.unwrap();
            });
        });
        let addr = rx.recv().unwrap();
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_server;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn invalid_selector_settings_rejected_before_network() {
        let settings = ReconcileSettings {
            supported_extensions: "|".into(),
            ..Default::default()
        };
        let err = run_with_settings(&settings).unwrap_err();
        assert!(matches!(err, ReconcileError::Selector(_)));
    }

    #[test]
    fn invalid_buffer_size_rejected() {
        let settings = ReconcileSettings {
            buffer_size: 0,
            ..Default::default()
        };
        let err = run_with_settings(&settings).unwrap_err();
        assert!(matches!(err, ReconcileError::Preprocessor(_)));
    }

    #[test]
    fn rejected_credentials_abort_batch() {
        let router = Router::new().route(
            "/session",
            post(|Json(_): Json<Value>| async {
                (axum::http::StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})))
            }),
        );
        let base = spawn_server(router);
        let mut settings = ReconcileSettings::default();
        settings.registry.base_url = base;
        settings.registry.timeout_secs = 5;

        let err = run_with_settings(&settings).unwrap_err();

        let partial = err.partial().unwrap();
        assert!(!partial.success);
        assert!(partial.results.is_empty());
    }
}
