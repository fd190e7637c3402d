use std::path::PathBuf;

use clap::Parser;
use utils::version;

/// Admission webhook translating logical FPGA function requests into
/// node-local resource names.
#[derive(Parser, Clone, Debug)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "LISTEN_ADDR",
        default_value = "0.0.0.0:8443",
        help = "Address the webhook listens on"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "TLS_CERT",
        requires = "tls_key",
        value_hint = clap::ValueHint::FilePath,
        help = "PEM certificate; plain HTTP is served when omitted"
    )]
    pub tls_cert: Option<PathBuf>,

    #[arg(
        long,
        env = "TLS_KEY",
        requires = "tls_cert",
        value_hint = clap::ValueHint::FilePath,
        help = "PEM private key matching --tls-cert"
    )]
    pub tls_key: Option<PathBuf>,

    #[arg(
        long,
        env = "FPGA_MAPPINGS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML stream of AcceleratorFunction documents, reloaded on change"
    )]
    pub mappings_file: Option<PathBuf>,

    #[arg(
        long,
        help = "Watch AcceleratorFunction custom resources in the cluster",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub watch_crds: bool,

    #[arg(
        long,
        env = "NAMESPACE",
        help = "Only read AcceleratorFunction objects from this namespace (all namespaces when omitted)"
    )]
    pub namespace: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["fpga-admission"]);
        assert_eq!(cli.listen_addr, "0.0.0.0:8443");
        assert!(cli.tls_cert.is_none());
        assert!(cli.watch_crds);
    }

    #[test]
    fn tls_files_come_in_pairs() {
        let result = Cli::try_parse_from(["fpga-admission", "--tls-cert", "/tls/tls.crt"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "fpga-admission",
            "--tls-cert",
            "/tls/tls.crt",
            "--tls-key",
            "/tls/tls.key",
            "--watch-crds",
            "false",
        ])
        .unwrap();
        assert_eq!(cli.tls_key, Some(PathBuf::from("/tls/tls.key")));
        assert!(!cli.watch_crds);
    }
}
