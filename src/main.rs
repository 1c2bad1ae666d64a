use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use campaign_mailer::config::{Config, DispatchSettings, ImportSettings, TemplateSettings};
use campaign_mailer::util::log_err;
use campaign_mailer::{routes, ErrorKind, LogTransport, Mailer, Renderer, State, Transport, DB};
use failure::Error;
use log::info;
use structopt::StructOpt;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let options = Options::from_args();
    options.setup_panic();
    options.start_logger();

    if let Err(err) = run(options).await {
        log_err(err);
        exit(1);
    }
}

async fn run(options: Options) -> Result<(), Error> {
    let serve_addr = options.serve_addr()?;
    let config = options.config();
    let renderer = Arc::new(Renderer::new(config.templates.clone())?);
    let db = DB::connect(&options.database_url)?;

    let transport: Arc<dyn Transport> = if options.dry_run {
        info!("Dry run: mail will be logged, not sent");
        Arc::new(LogTransport)
    } else {
        let from = options
            .smtp_from
            .as_deref()
            .ok_or(ErrorKind::MissingParameter("smtp-from"))?;
        let credentials = match (options.smtp_user.clone(), options.smtp_pass.clone()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Arc::new(Mailer::new(
            &options.smtp_host,
            options.smtp_port,
            from,
            credentials,
            options.smtp_reply_to.as_deref(),
        )?)
    };

    let state = State::new(db, renderer, transport, config);
    info!("Serving on {}", serve_addr);
    warp::serve(routes(state)).run(serve_addr).await;
    Ok(())
}

#[derive(Debug, StructOpt)]
#[structopt(setting = structopt::clap::AppSettings::ColoredHelp)]
struct Options {
    /// Turns off message output.
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,

    /// Increases the verbosity. Default verbosity is errors and warnings.
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: usize,

    /// Logs at least at the debug level, whatever the verbosity.
    #[structopt(long = "debug")]
    debug: bool,

    /// The path of the SQLite database. `:memory:` keeps everything in memory.
    #[structopt(short = "d", long = "db", env = "DATABASE_URL", default_value = "campaigns.db")]
    database_url: String,

    /// The host to serve on.
    #[structopt(long = "host", env = "HOST", default_value = "::")]
    host: String,

    /// The port to serve on.
    #[structopt(short = "p", long = "port", env = "PORT", default_value = "8000")]
    port: u16,

    /// Logs mail instead of sending it.
    #[structopt(long = "dry-run")]
    dry_run: bool,

    /// The SMTP server to relay through.
    #[structopt(long = "smtp-host", env = "SMTP_HOST", default_value = "smtp.gmail.com")]
    smtp_host: String,

    /// The SMTP server's port.
    #[structopt(long = "smtp-port", env = "SMTP_PORT", default_value = "587")]
    smtp_port: u16,

    /// The SMTP From header to use. Required unless this is a dry run.
    #[structopt(long = "smtp-from", env = "SMTP_FROM")]
    smtp_from: Option<String>,

    /// The SMTP username to use.
    #[structopt(long = "smtp-user", env = "SMTP_USER")]
    smtp_user: Option<String>,

    /// The SMTP password to use.
    #[structopt(long = "smtp-pass", env = "SMTP_PASS", hide_env_values = true)]
    smtp_pass: Option<String>,

    /// The SMTP Reply-To header to use.
    #[structopt(long = "smtp-reply-to", env = "SMTP_REPLY_TO")]
    smtp_reply_to: Option<String>,

    /// A directory of extra template files, loaded over the built-in ones.
    #[structopt(long = "template-dir", env = "TEMPLATE_DIR", parse(from_os_str))]
    template_dir: Option<PathBuf>,

    /// The built-in template sent when nothing else is chosen.
    #[structopt(long = "default-template", env = "DEFAULT_TEMPLATE", default_value = "1")]
    default_template: u32,

    /// The message sent when neither the request nor the campaign has one.
    #[structopt(long = "default-message", env = "DEFAULT_MESSAGE")]
    default_message: Option<String>,

    /// The largest accepted spreadsheet upload, in bytes.
    #[structopt(long = "max-upload", env = "MAX_UPLOAD_BYTES", default_value = "10485760")]
    max_upload_bytes: u64,

    /// The syslog server to send logs to.
    #[structopt(short = "s", long = "syslog-server", env = "SYSLOG_SERVER")]
    syslog_server: Option<String>,
}

impl Options {
    /// Get the address to serve on.
    fn serve_addr(&self) -> Result<SocketAddr, Error> {
        (&self.host as &str, self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| failure::format_err!("No matching address exists"))
    }

    /// Builds the runtime settings from the defaults and the flags given.
    fn config(&self) -> Config {
        let defaults = DispatchSettings::default();
        Config {
            dispatch: DispatchSettings {
                default_builtin: self.default_template,
                default_message: self
                    .default_message
                    .clone()
                    .unwrap_or(defaults.default_message),
                ..defaults
            },
            import: ImportSettings {
                max_upload_bytes: self.max_upload_bytes,
                ..ImportSettings::default()
            },
            templates: TemplateSettings {
                dir: self.template_dir.clone(),
                ..TemplateSettings::default()
            },
        }
    }

    /// Sets up the panic handler.
    #[cfg(debug_assertions)]
    fn setup_panic(&self) {}

    /// Sets up the panic handler.
    #[cfg(not(debug_assertions))]
    fn setup_panic(&self) {
        if self.verbose == 0 && !self.debug {
            human_panic::setup_panic!();
        }
    }

    /// Sets up logging as specified by the `-q`, `-s`, and `-v` flags.
    fn start_logger(&self) {
        if self.quiet {
            return;
        }
        let verbose = if self.debug {
            self.verbose.max(2)
        } else {
            self.verbose
        };
        let log_level = match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };

        let r = if let Some(ref server) = self.syslog_server {
            syslog::init_tcp(
                server.as_str(),
                "campaign-mailer".to_string(),
                syslog::Facility::LOG_DAEMON,
                log_level,
            )
        } else {
            syslog::init(
                syslog::Facility::LOG_DAEMON,
                log_level,
                Some("campaign-mailer"),
            )
        };

        if let Err(err) = r {
            eprintln!("Warning: logging couldn't start: {}", err);
        }
    }
}
