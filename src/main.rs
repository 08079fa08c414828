use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use codestream_agent::router::methods;
use codestream_agent::{
    apply_patch, parse_patch, parse_uri, Config, EntityManagers, FetchReviewsRequest, GitCli,
    HttpApiClient, RequestRouter, ReviewContentsRequest, ReviewRequest,
};

#[derive(Parser)]
#[command(name = "codestream-agent")]
#[command(about = "Code review agent: review caches, file reconstruction and request routing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to agent configuration
    #[arg(long, default_value = ".codestream/agent.yml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a codestream-diff URI into its parts
    ParseUri {
        uri: String,
    },

    /// List reviews
    Reviews {
        /// Restrict to these review ids
        #[arg(long = "id")]
        ids: Vec<String>,
    },

    /// Print the base and head contents of one reviewed file
    Contents {
        #[arg(long)]
        review: String,

        #[arg(long)]
        repo: String,

        /// Repo-relative file path
        #[arg(long)]
        path: String,
    },

    /// Check that a review can be opened locally
    Preconditions {
        #[arg(long)]
        review: String,
    },

    /// Dispatch a raw request, e.g. codestream/review '{"reviewId":"..."}'
    Request {
        method: String,

        /// JSON params (null when omitted)
        params: Option<String>,
    },

    /// Apply a single-file unified diff to a local file
    ApplyPatch {
        #[arg(long)]
        base: PathBuf,

        #[arg(long)]
        patch: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = Config::read_file(&cli.config)?;

    let level = loaded
        .as_ref()
        .map(Config::effective_trace_level)
        .unwrap_or_else(|| Config::default().effective_trace_level());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("codestream_agent={}", level.filter_directive()).parse()?),
        )
        .init();

    let config = Config::log_loaded(&cli.config, loaded);

    match cli.command {
        Commands::ParseUri { uri } => {
            print_json(&parse_uri(&uri)?)?;
        }
        Commands::ApplyPatch { base, patch } => {
            run_apply_patch(base, patch)?;
        }
        command => {
            let router = build_router(&config);
            run_request(&router, command).await?;
        }
    }

    Ok(())
}

fn build_router(config: &Config) -> RequestRouter {
    let client = Arc::new(HttpApiClient::new(
        config.server.url.clone(),
        config.server.token.clone(),
    ));
    let git = Arc::new(GitCli::new(
        config.git.path.clone(),
        config.repositories.clone(),
    ));

    let managers = EntityManagers::new(client, git);
    info!(server = %config.server.url, "Agent session ready");

    RequestRouter::with_reviews(managers.reviews)
}

async fn run_request(router: &RequestRouter, command: Commands) -> Result<()> {
    let (method, params) = match command {
        Commands::Reviews { ids } => {
            let request = FetchReviewsRequest {
                review_ids: (!ids.is_empty()).then_some(ids),
            };
            (methods::FETCH_REVIEWS.to_string(), serde_json::to_value(request)?)
        }
        Commands::Contents { review, repo, path } => {
            let request = ReviewContentsRequest {
                review_id: review,
                repo_id: repo,
                path,
            };
            (
                methods::REVIEW_CONTENTS.to_string(),
                serde_json::to_value(request)?,
            )
        }
        Commands::Preconditions { review } => {
            let request = ReviewRequest { review_id: review };
            (
                methods::CHECK_PRECONDITIONS.to_string(),
                serde_json::to_value(request)?,
            )
        }
        Commands::Request { method, params } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid JSON params for {}", method))?,
                None => Value::Null,
            };
            (method, params)
        }
        Commands::ParseUri { .. } | Commands::ApplyPatch { .. } => {
            anyhow::bail!("Command does not go through the request router")
        }
    };

    let response = router
        .handle(&method, params)
        .await
        .with_context(|| format!("Request {} failed", method))?;
    print_json(&response)
}

fn run_apply_patch(base: PathBuf, patch: PathBuf) -> Result<()> {
    let source = fs::read_to_string(&base)
        .with_context(|| format!("Failed to read base file: {}", base.display()))?;
    let diff = fs::read_to_string(&patch)
        .with_context(|| format!("Failed to read patch file: {}", patch.display()))?;

    let patches = parse_patch(&diff)?;
    let [file_patch] = patches.as_slice() else {
        anyhow::bail!(
            "Expected a patch for exactly one file, found {}",
            patches.len()
        );
    };

    let patched = apply_patch(&source, file_patch)
        .with_context(|| format!("Patch does not apply to {}", base.display()))?;
    print!("{}", patched);

    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
