//! CLI adapter for the deployd control plane.
//!
//! Parses arguments, sets up logging, wires the controller together, and
//! serves until a termination signal arrives. The signal handler clears the
//! server's stop flag; once the accept loops drain, every in-flight
//! deployment worker is stopped and joined before exit.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use deployd::auth::FileAuthenticator;
use deployd::jenkins::{Jenkins, JenkinsConfig};
use deployd::web::{Controller, WebServer};

#[derive(Parser, Debug)]
#[command(name = "deployd", version)]
#[command(about = "Self-hosted deployment control plane")]
pub struct Cli {
    /// Data directory for deployment.json and deploy key files.
    #[arg(long, default_value = ".")]
    deploy_path: PathBuf,

    /// Address and port to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Mount prefix for the web interface.
    #[arg(long, default_value = "/deploy")]
    mount: String,

    /// Credentials file with one user:sha256hex entry per line.
    #[arg(long)]
    auth_file: PathBuf,

    /// Base URL of the Jenkins server used for build freshness checks.
    #[arg(long)]
    jenkins_url: Option<String>,

    /// Jenkins API user.
    #[arg(long)]
    jenkins_user: Option<String>,

    /// Jenkins API token.
    #[arg(long)]
    jenkins_token: Option<String>,

    /// Number of request handler threads.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Write logs to deployd.log in this directory instead of stderr.
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Verbose logging in the terminal.
    #[arg(long)]
    debug: bool,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_log(&cli)?;

    std::fs::create_dir_all(&cli.deploy_path).with_context(|| {
        format!(
            "failed to create deploy data directory {}",
            cli.deploy_path.display()
        )
    })?;

    let auth = FileAuthenticator::from_file(&cli.auth_file)?;
    let jenkins = match &cli.jenkins_url {
        Some(url) => Some(Jenkins::new(&JenkinsConfig {
            url: url.clone(),
            user: cli.jenkins_user.clone(),
            token: cli.jenkins_token.clone(),
        })?),
        None => None,
    };

    let controller = Arc::new(Controller::new(
        &cli.mount,
        &cli.deploy_path,
        Box::new(auth),
        jenkins,
    )?);

    let server = WebServer::bind(Arc::clone(&controller), &cli.listen)?;
    let running = server.stop_flag();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    server.run(cli.workers);

    // Drain in-flight deployment workers before exiting.
    info!("shutting down, stopping deployment workers");
    controller.supervisor().stop_all();
    Ok(())
}

fn setup_log(cli: &Cli) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.debug { "debug" } else { "info" }),
    );
    if let Some(log_path) = &cli.log_path {
        std::fs::create_dir_all(log_path)
            .with_context(|| format!("failed to create log directory {}", log_path.display()))?;
        let file = File::create(log_path.join("deployd.log"))
            .with_context(|| format!("failed to open log file in {}", log_path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_documented_surface() {
        let cli = Cli::parse_from(["deployd", "--auth-file", "credentials"]);
        assert_eq!(cli.deploy_path, PathBuf::from("."));
        assert_eq!(cli.listen, "127.0.0.1:8080");
        assert_eq!(cli.mount, "/deploy");
        assert_eq!(cli.workers, 8);
        assert!(!cli.debug);
        assert!(cli.jenkins_url.is_none());
    }
}
