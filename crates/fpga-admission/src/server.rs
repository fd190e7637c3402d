use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionRequest;
use kube::core::admission::AdmissionResponse;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use poem::handler;
use poem::listener::Listener;
use poem::listener::RustlsCertificate;
use poem::listener::RustlsConfig;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::errors::AdmissionError;
use crate::translator::Translator;

/// Certificate and key files for the HTTPS listener.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Mutating admission endpoint for pods
pub struct AdmissionServer {
    listen_addr: String,
    tls: Option<TlsFiles>,
    translator: Arc<Translator>,
}

impl AdmissionServer {
    pub fn new(listen_addr: String, tls: Option<TlsFiles>, translator: Arc<Translator>) -> Self {
        Self {
            listen_addr,
            tls,
            translator,
        }
    }

    /// Serves `POST /pods` until `cancellation_token` fires.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::ServerError`] if the certificates cannot be read or
    ///   the server fails to bind
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<AdmissionError>> {
        info!("Starting admission webhook on {}", self.listen_addr);
        let app = routes(self.translator);
        let listener = TcpListener::bind(self.listen_addr.clone());

        let served = match &self.tls {
            Some(tls) => {
                let config = rustls_config(tls)?;
                Server::new(listener.rustls(config))
                    .run_with_graceful_shutdown(
                        app,
                        cancellation_token.cancelled(),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            }
            None => {
                warn!("no TLS certificate configured, serving plain HTTP");
                Server::new(listener)
                    .run_with_graceful_shutdown(
                        app,
                        cancellation_token.cancelled(),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            }
        };

        served.change_context(AdmissionError::ServerError {
            message: format!("webhook on {} failed", self.listen_addr),
        })?;
        info!("Admission webhook stopped");
        Ok(())
    }
}

fn rustls_config(tls: &TlsFiles) -> Result<RustlsConfig, Report<AdmissionError>> {
    let read = |path: &PathBuf| {
        std::fs::read(path).change_context_lazy(|| AdmissionError::ServerError {
            message: format!("cannot read {}", path.display()),
        })
    };
    let certificate = RustlsCertificate::new()
        .cert(read(&tls.cert)?)
        .key(read(&tls.key)?);
    Ok(RustlsConfig::new().fallback(certificate))
}

/// Webhook routes, shared by the server and tests.
pub fn routes(translator: Arc<Translator>) -> impl Endpoint {
    Route::new()
        .at("/pods", post(mutate_pods))
        .data(translator)
        .with(Tracing)
}

#[handler]
async fn mutate_pods(
    Json(review): Json<AdmissionReview<Pod>>,
    translator: Data<&Arc<Translator>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!("invalid admission review: {e}");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_pod(&translator, &request).into_review())
}

/// Allows the pod with a patch, or denies it with the translation error.
pub fn review_pod(translator: &Translator, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(pod) = &request.object else {
        return response;
    };
    let pod_name = format!(
        "{}/{}",
        request.namespace.as_deref().unwrap_or_default(),
        pod.metadata
            .name
            .as_deref()
            .or(pod.metadata.generate_name.as_deref())
            .unwrap_or_default()
    );

    let namespace = request
        .namespace
        .as_deref()
        .or(pod.metadata.namespace.as_deref());
    match translator.translate(namespace, pod) {
        Ok(translation) if translation.is_empty() => response,
        Ok(translation) => {
            info!(pod = %pod_name, rewritten = ?translation.rewritten, "pod resources translated");
            match response.clone().with_patch(translation.patch) {
                Ok(patched) => patched,
                Err(e) => response.deny(format!("failed to serialize patch: {e}")),
            }
        }
        Err(e) => {
            warn!(pod = %pod_name, "pod rejected: {e}");
            response.deny(e.to_string())
        }
    }
}
