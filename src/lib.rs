use thiserror::Error;

pub mod accessor;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod crd;
pub mod error;
pub mod poll;

#[cfg(test)]
mod testing;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error("Access error: {0}")]
    AccessError(#[from] accessor::AccessError),

    #[error("{0}")]
    WaitError(#[from] cluster::WaitError),

    #[error("{0}")]
    ReplicateError(#[from] bootstrap::ReplicateError),

    #[error("{0}")]
    CloneError(#[from] bootstrap::CloneFailure),

    #[error("Unable to read packages: {0}")]
    PackagesError(#[from] serde_yaml::Error),

    #[error("Unable to read {0}: {1}")]
    ReadError(String, #[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
