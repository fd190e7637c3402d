//! Admission webhook that rewrites logical FPGA function requests into the
//! concrete resource names advertised by the node plugin.

pub mod config;
pub mod errors;
pub mod mapping_source;
pub mod server;
pub mod translator;

pub use translator::TranslateError;
pub use translator::Translation;
pub use translator::Translator;
