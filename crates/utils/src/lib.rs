pub mod keyed_lock;
pub mod kube_client;
pub mod logging;
pub mod version;
