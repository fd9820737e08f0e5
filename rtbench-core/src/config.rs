use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 51250;

/// Settings for the tester service. Built by the CLI layer and handed to
/// [`crate::tester::TesterService::bind`].
#[derive(Debug, Clone)]
pub struct TesterConfig {
    pub port: u16,
    /// Target host:port the workers benchmark.
    pub target: String,
    /// Collector host:port results are forwarded to.
    pub collector: String,
    /// Trusted CA bundle (PEM). System roots when absent.
    pub cas: Option<PathBuf>,
    /// Client certificate (PEM); used only when `key` is also present.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Skip target name verification for HTTPS requests. The certificate
    /// chain is still verified against the trusted roots.
    pub skip_name_check: bool,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub port: u16,
    /// CSV output file, opened in append mode.
    pub csv_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub port: u16,
    /// Client CA bundle (PEM); enables mutual TLS when set together with
    /// `cert` and `key`.
    pub cas: Option<PathBuf>,
    /// Server certificate (PEM); TLS is enabled iff both `cert` and `key`
    /// are present.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}
