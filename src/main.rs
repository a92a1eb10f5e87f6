use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Side, find_token, load_config_file},
    dry_run::DryRun,
    gitlab::{GitLabClient, GitLabConfig, HostingApi},
    mirror::Credentials,
    reconcile::{Exclusions, Reconciler, SourceTree},
    report::Report,
    resolver::{Entity, resolve},
};

mod config;
mod dry_run;
mod fanout;
mod gitlab;
mod materialize;
mod mirror;
mod path;
mod reconcile;
mod report;
mod resolver;
#[cfg(test)]
mod testing;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Mirror a GitLab group, its subgroups, and its projects' branches and tags
/// onto another GitLab instance. Safe to re-run: only missing groups and
/// projects are created.
#[derive(Parser)]
#[command(author, version, about, arg_required_else_help = true)]
struct Args {
    /// Source GitLab URL, e.g. https://gitlab-source.com
    #[arg(long, alias = "gitlab-src-url")]
    src_url: String,

    /// Destination GitLab URL, e.g. https://gitlab-destination.com
    #[arg(long, alias = "gitlab-dest-url")]
    dest_url: String,

    /// Source access token (falls back to GLMIRROR_SRC_TOKEN, GITLAB_TOKEN, config file)
    #[arg(long)]
    src_token: Option<String>,

    /// Destination access token (falls back to GLMIRROR_DEST_TOKEN, GITLAB_TOKEN, config file)
    #[arg(long)]
    dest_token: Option<String>,

    /// Source root group, by numeric id or full path
    #[arg(long, alias = "groupid")]
    group_id: String,

    /// Clone cache directory, reused across runs. Defaults to a temporary directory.
    #[arg(long, alias = "cachedir")]
    cache_dir: Option<PathBuf>,

    /// Project paths to skip, e.g. dso/app1,dso/app2
    #[arg(long, value_delimiter = ',')]
    ignore_project_paths: Vec<String>,

    /// Concurrent repository syncs (default: number of CPUs)
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Report what would be created without changing the destination
    #[arg(long)]
    dry_run: bool,

    /// Create groups and projects but skip repository content
    #[arg(long)]
    topology_only: bool,

    /// Exit with status 1 if any group, project, or repository failed
    #[arg(long)]
    strict: bool,

    #[arg(long, short, help = "Enable verbose output")]
    verbose: bool,
}

fn main() {
    match inner_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = ?e);
            std::process::exit(1);
        }
    }
}

fn inner_main() -> Result<i32> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), default_level)));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_file = load_config_file().context("loading config file")?;
    let credentials = Credentials {
        source: find_token(
            Side::Source,
            &args.src_url,
            args.src_token.as_deref(),
            config_file.as_ref(),
        )?,
        destination: find_token(
            Side::Destination,
            &args.dest_url,
            args.dest_token.as_deref(),
            config_file.as_ref(),
        )?,
    };

    let source = GitLabClient::new(GitLabConfig {
        base_url: args.src_url.clone(),
        token: credentials.source.clone(),
        timeout: HTTP_TIMEOUT,
    });
    let destination = GitLabClient::new(GitLabConfig {
        base_url: args.dest_url.clone(),
        token: credentials.destination.clone(),
        timeout: HTTP_TIMEOUT,
    });

    let user = source
        .current_user()
        .with_context(|| format!("authenticating to {}", source.base_url()))?;
    tracing::debug!("authenticated to {} as {}", source.base_url(), user.username);
    let user = destination
        .current_user()
        .with_context(|| format!("authenticating to {}", destination.base_url()))?;
    tracing::debug!(
        "authenticated to {} as {}",
        destination.base_url(),
        user.username
    );

    let root = match resolve(&source, &args.group_id)
        .with_context(|| format!("looking up source group {}", args.group_id))?
    {
        Some(Entity::Group(group)) => group,
        Some(entity @ Entity::Project(_)) => {
            bail!("{} is a project, not a group", entity.full_path())
        }
        None => bail!("source group {} not found", args.group_id),
    };
    let tree = SourceTree::read(&source, root)?;
    let exclusions = Exclusions::new(&args.ignore_project_paths);
    if !exclusions.is_empty() {
        tracing::info!("ignoring {} project path(s)", exclusions.len());
    }
    let report = Report::new();

    if args.dry_run {
        let overlay = DryRun::new(&destination);
        let reconciler = Reconciler::new(&source, &overlay, &report).dry_run(true);
        reconciler.reconcile_groups(&tree, &exclusions);
        reconciler.reconcile_projects(&tree, &exclusions);
        tracing::info!("dry run: skipping repository content");
    } else {
        // Projects must exist on the destination before anything is pushed.
        let reconciler = Reconciler::new(&source, &destination, &report);
        reconciler.reconcile_groups(&tree, &exclusions);
        let targets = reconciler.reconcile_projects(&tree, &exclusions);

        if args.topology_only {
            tracing::info!("topology only: skipping repository content");
        } else {
            let (cache_root, _temp_dir) = match args.cache_dir {
                Some(dir) => (dir, None),
                None => {
                    let dir = tempfile::Builder::new()
                        .prefix("glmirror-")
                        .tempdir()
                        .context("creating temporary cache directory")?;
                    (dir.path().to_path_buf(), Some(dir))
                }
            };
            tracing::info!("using cache directory {}", cache_root.display());

            let workers = args.jobs.unwrap_or_else(fanout::default_workers);
            fanout::sync_all(&targets, &cache_root, &credentials, workers, &report)?;
        }
    }

    report.print_summary();
    if args.strict && report.has_failures() {
        return Ok(1);
    }
    Ok(0)
}
