//! Kubernetes API client setup shared by the node daemon and the webhook.

use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

#[derive(Debug, thiserror::Error)]
pub enum KubeClientError {
    #[error("cannot load kubeconfig {path}")]
    Kubeconfig { path: String },
    #[error("cannot create Kubernetes client")]
    Client,
}

/// Connects with `kubeconfig` when given, otherwise with the in-cluster
/// service account or `~/.kube/config`.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client, Report<KubeClientError>> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .change_context(KubeClientError::Client);
    };

    let kubeconfig_error = || KubeClientError::Kubeconfig {
        path: path.display().to_string(),
    };
    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(kubeconfig_error)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(kubeconfig_error)?;
    Client::try_from(config).change_context(KubeClientError::Client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreadable_kubeconfig_names_the_file() {
        let err = connect(Some(Path::new("/nonexistent/kubeconfig")))
            .await
            .err()
            .expect("connect should fail for a missing kubeconfig");
        assert!(err
            .current_context()
            .to_string()
            .contains("/nonexistent/kubeconfig"));
    }
}
