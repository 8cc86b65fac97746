use std::env;
use std::ffi::OsStr;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::debug;

use crate::k8s::types::KubernetesError;

/// Build a client from an explicit kubeconfig, or from the in-cluster
/// service account / `~/.kube/config` when none is given.
///
/// `kubeconfig` may list several files separated like `PATH`; they are merged
/// in order, the first file winning on conflicting entries.
///
/// # Errors
///
/// - [`KubernetesError::ConnectionFailed`] if the configuration cannot be loaded
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let paths = kubeconfig
        .map(|raw| kubeconfig_paths(raw.as_os_str()))
        .unwrap_or_default();

    if paths.is_empty() {
        return Client::try_default()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client".to_string(),
            });
    }

    let kubeconfig = load_kubeconfig(&paths)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context(KubernetesError::ConnectionFailed {
            message: "Failed to create config from kubeconfig".to_string(),
        })?;

    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
    })
}

/// Split a `KUBECONFIG`-style list, dropping empty entries.
fn kubeconfig_paths(raw: &OsStr) -> Vec<PathBuf> {
    env::split_paths(raw)
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

fn load_kubeconfig(paths: &[PathBuf]) -> Result<Kubeconfig, Report<KubernetesError>> {
    let mut merged: Option<Kubeconfig> = None;
    for path in paths {
        debug!(file = %path.display(), "loading kubeconfig");
        let next = Kubeconfig::read_from(path).change_context_lazy(|| {
            KubernetesError::ConnectionFailed {
                message: format!("Failed to read kubeconfig file: {}", path.display()),
            }
        })?;
        merged = Some(match merged {
            None => next,
            Some(current) => current.merge(next).change_context_lazy(|| {
                KubernetesError::ConnectionFailed {
                    message: format!("Failed to merge kubeconfig file: {}", path.display()),
                }
            })?,
        });
    }
    merged.ok_or_else(|| {
        Report::new(KubernetesError::ConnectionFailed {
            message: "No kubeconfig file given".to_string(),
        })
    })
}
