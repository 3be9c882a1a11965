//! Runtime configuration for the controller process. This can be set up
//! manually in code or, with the `cli` feature, parsed from flags and
//! environment variables via [`Config::new_from_flags`].

use std::net::IpAddr;
use std::path::PathBuf;

const DEFAULT_WEBHOOK_PORT: u16 = 9443;
const DEFAULT_WORKERS: usize = 1;

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of reconcile workers draining the pool queue.
    pub workers: usize,
    pub server_config: ServerConfig,
}

/// TLS endpoint the webhook server binds.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: IpAddr,
    pub port: u16,
    pub cert_file: PathBuf,
    pub private_key_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: DEFAULT_WORKERS,
            server_config: ServerConfig {
                addr: "0.0.0.0".parse().unwrap(),
                port: DEFAULT_WEBHOOK_PORT,
                cert_file: PathBuf::from("/etc/webhook/tls.crt"),
                private_key_file: PathBuf::from("/etc/webhook/tls.key"),
            },
        }
    }
}

impl Config {
    /// Parses command line flags, falling back to the defaults above. The
    /// version of the binary is passed through so `--version` reports it.
    #[cfg(feature = "cli")]
    pub fn new_from_flags(version: &str) -> Self {
        use structopt::clap::AppSettings;
        use structopt::StructOpt;

        let app = Opts::clap()
            .version(version)
            .setting(AppSettings::DeriveDisplayOrder);
        let opts = Opts::from_clap(&app.get_matches());
        let defaults = Config::default();
        Config {
            workers: opts.workers.unwrap_or(defaults.workers),
            server_config: ServerConfig {
                addr: opts.addr.unwrap_or(defaults.server_config.addr),
                port: opts.port.unwrap_or(defaults.server_config.port),
                cert_file: opts
                    .cert_file
                    .unwrap_or(defaults.server_config.cert_file),
                private_key_file: opts
                    .private_key_file
                    .unwrap_or(defaults.server_config.private_key_file),
            },
        }
    }
}

#[cfg(feature = "cli")]
#[derive(structopt::StructOpt)]
#[structopt(name = "gpu-controller", about = "GPU pool control plane")]
struct Opts {
    #[structopt(
        long = "workers",
        env = "GPU_CONTROLLER_WORKERS",
        help = "Number of reconcile workers"
    )]
    workers: Option<usize>,

    #[structopt(
        long = "addr",
        env = "GPU_WEBHOOK_ADDR",
        help = "Address the webhook server binds"
    )]
    addr: Option<IpAddr>,

    #[structopt(
        long = "port",
        env = "GPU_WEBHOOK_PORT",
        help = "Port the webhook server binds"
    )]
    port: Option<u16>,

    #[structopt(
        long = "cert-file",
        env = "GPU_WEBHOOK_CERT",
        help = "Path to the webhook TLS certificate"
    )]
    cert_file: Option<PathBuf>,

    #[structopt(
        long = "private-key-file",
        env = "GPU_WEBHOOK_KEY",
        help = "Path to the webhook TLS private key"
    )]
    private_key_file: Option<PathBuf>,
}
