mod checkpoint;
mod cluster;
mod config;
mod error;
mod lm;
mod messages;
mod observe;
mod pipeline;
mod prompts;
mod retry;
mod stages;
mod sum;
mod vis;

use crate::checkpoint::CheckpointStore;
use crate::cluster::ThemeClusterer;
use crate::config::DigestConfig;
use crate::error::DigestResult;
use crate::lm::{ImageDescriber, LmClient, Transcriber};
use crate::messages::{MessageSource, SqliteMessages, TimeWindow};
use crate::observe::Observer;
use crate::pipeline::{Orchestrator, PipelineOptions, RunReport, Services};
use crate::retry::{Executor, TokioSleeper};
use crate::stages::RedoFlags;
use crate::sum::WebFetcher;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "group_digest",
    about = "Summarize archived group chats: describe images, summarize links, cluster themes, write a digest"
)]
struct Cli {
    /// Configuration file (defaults to the first digestconf.txt found)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter passed to env_logger (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Group id to summarize; repeat for several groups
    #[arg(long = "group", value_name = "ID")]
    groups: Vec<String>,

    /// Directory for summary_<name>_<id>.md files (stdout when unset)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Write all summaries into this one file instead of one file per group
    #[arg(long, conflicts_with = "output_dir")]
    output: Option<PathBuf>,

    /// First day to include (YYYY-MM-DD)
    #[arg(long, conflicts_with_all = ["last_week", "last_month"])]
    since: Option<NaiveDate>,

    /// Last day to include (YYYY-MM-DD, inclusive)
    #[arg(long, conflicts_with_all = ["last_week", "last_month"])]
    until: Option<NaiveDate>,

    /// Only the last 7 days
    #[arg(long, default_value_t = false, conflicts_with = "last_month")]
    last_week: bool,

    /// Only the last 28 days
    #[arg(long, default_value_t = false)]
    last_month: bool,

    /// Print the groups found in the database and exit
    #[arg(long, default_value_t = false)]
    list_groups: bool,

    #[arg(long, default_value_t = false)]
    regenerate_attachment_descriptions: bool,

    #[arg(long, visible_alias = "redo-links", default_value_t = false)]
    regenerate_link_summaries: bool,

    #[arg(long, default_value_t = false)]
    redo_merging: bool,

    /// Re-extract and re-cluster themes (also redoes merging)
    #[arg(long, default_value_t = false)]
    redo_themes: bool,

    /// Checkpoint file used to resume interrupted runs
    #[arg(long)]
    resume_file: Option<PathBuf>,

    /// Keep the resume file even after every group finished
    #[arg(long, default_value_t = false)]
    keep_resume_file: bool,
}

impl Cli {
    fn time_window(&self, now: DateTime<Utc>) -> TimeWindow {
        if self.last_week {
            TimeWindow::last_days(now, 7)
        } else if self.last_month {
            TimeWindow::last_days(now, 28)
        } else if self.since.is_none() && self.until.is_none() {
            TimeWindow::all()
        } else {
            TimeWindow::from_dates(self.since, self.until)
        }
    }

    fn redo_flags(&self) -> RedoFlags {
        RedoFlags {
            attachment_descriptions: self.regenerate_attachment_descriptions,
            link_summaries: self.regenerate_link_summaries,
            merging: self.redo_merging,
            themes: self.redo_themes,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logger - must be done before any logging calls
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str()))
        .format_timestamp_secs()
        .init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("❌ {}", e);
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns `false` when at least one group failed.
async fn run(cli: Cli) -> DigestResult<bool> {
    let config = DigestConfig::load(cli.config.as_deref())?;
    let observer = Observer::new("group_digest", config.log_model_payloads);
    let source = SqliteMessages::open(&config.database)?;

    if cli.list_groups {
        for (id, name) in source.list_groups()? {
            println!("ID: {}, Name: {}", id, name);
        }
        return Ok(true);
    }

    let group_ids: Vec<String> = if !cli.groups.is_empty() {
        cli.groups.clone()
    } else if !config.groups.is_empty() {
        config.groups.clone()
    } else {
        source.list_groups()?.into_iter().map(|(id, _)| id).collect()
    };
    if group_ids.is_empty() {
        warn!(target: observer.target(), "⚠️ No groups to summarize in {}", config.database.display());
        return Ok(true);
    }

    let window = cli.time_window(Utc::now());
    let redo = cli.redo_flags();
    let resume_file = cli.resume_file.clone().or(config.resume_file);
    // --output replaces per-group files, including OUTPUT_DIR from the config.
    let output_dir = match cli.output {
        Some(_) => None,
        None => cli.output_dir.clone().or(config.output_dir),
    };

    let executor = Executor::new(config.retry, Arc::new(TokioSleeper), &observer);
    let fetch_timeout = Duration::from_secs(config.summary.timeout);
    let summarizer = Arc::new(LmClient::new(config.summary, &observer)?);
    let vision: Option<Arc<dyn ImageDescriber>> = match config.vision {
        Some(settings) => {
            let client = LmClient::new(settings, &observer)?;
            info!(target: observer.target(), "🖼️ Vision model: {}", client.model());
            let client: Arc<dyn ImageDescriber> = Arc::new(client);
            Some(client)
        }
        None => None,
    };
    let transcriber: Option<Arc<dyn Transcriber>> = match config.transcription {
        Some(settings) => {
            let client = LmClient::new(settings, &observer)?;
            info!(target: observer.target(), "🎙️ Transcription model: {}", client.model());
            let client: Arc<dyn Transcriber> = Arc::new(client);
            Some(client)
        }
        None => None,
    };
    let embedder = Arc::new(LmClient::new(config.embedding, &observer)?);
    info!(
        target: observer.target(),
        "🤖 Summary model: {}, embedding model: {}, retry delays: {:?}",
        summarizer.model(),
        embedder.model(),
        executor.plan().delays()
    );
    if observer.log_payloads() {
        info!(target: observer.target(), "📦 Model payloads will be logged at info level");
    }
    let fetcher = Arc::new(WebFetcher::new(fetch_timeout, &observer)?);

    let clusterer = ThemeClusterer::new(embedder, executor.clone(), config.clustering, &observer);
    let checkpoint = CheckpointStore::load(resume_file.as_deref(), &observer);
    let options = PipelineOptions {
        redo,
        prompts: config.prompts,
        output_dir,
    };
    let mut orchestrator = Orchestrator::new(
        Services {
            summarizer,
            vision,
            transcriber,
            fetcher,
        },
        executor,
        clusterer,
        checkpoint,
        resume_file,
        options,
        &observer,
    );

    info!(target: observer.target(), "🚀 Summarizing {} group(s)", group_ids.len());
    let report = orchestrator.run(&source, &group_ids, &window).await?;
    orchestrator.finish(cli.keep_resume_file)?;

    let rendered = render_summaries(&report);
    match &cli.output {
        Some(path) if !report.completed.is_empty() => {
            fs::write(path, &rendered)?;
            info!(target: observer.target(), "📝 {} summaries written to {}", report.completed.len(), path.display());
        }
        Some(_) => {}
        None => print!("{}", rendered),
    }
    log_report(&report, &observer);
    Ok(report.failed.is_empty())
}

/// Summaries that were not written to their own file, one section per group.
fn render_summaries(report: &RunReport) -> String {
    report
        .completed
        .iter()
        .filter(|done| done.output_path.is_none())
        .map(|done| format!("# {}\n\n{}\n\n", done.group_name, done.summary.trim()))
        .collect()
}

fn log_report(report: &RunReport, observer: &Observer) {
    let target = observer.target();
    info!(
        target: target,
        "📊 Done: {} completed, {} skipped, {} failed",
        report.completed.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for done in &report.completed {
        info!(target: target, "✅ {} ({}) ran {:?}", done.group_name, done.group_id, done.executed);
    }
    for (group_id, reason) in &report.failed {
        error!(target: target, "❌ {} failed: {}", group_id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GroupSummary;
    use chrono::TimeZone;

    #[test]
    fn test_redo_flags_from_cli() {
        let cli = Cli::try_parse_from(["group_digest", "--redo-links", "--redo-themes", "--group", "a", "--group", "b"])
            .unwrap();
        assert_eq!(cli.groups, vec!["a", "b"]);
        let flags = cli.redo_flags();
        assert!(flags.link_summaries);
        assert!(flags.themes);
        assert!(!flags.attachment_descriptions);
        assert!(!flags.merging);
    }

    #[test]
    fn test_time_window_flags() {
        let now = Utc.with_ymd_and_hms(2024, 3, 29, 12, 0, 0).unwrap();

        let cli = Cli::try_parse_from(["group_digest", "--last-week"]).unwrap();
        assert_eq!(cli.time_window(now).start, Some(Utc.with_ymd_and_hms(2024, 3, 22, 12, 0, 0).unwrap()));

        let cli = Cli::try_parse_from(["group_digest", "--since", "2024-03-01"]).unwrap();
        let window = cli.time_window(now);
        assert_eq!(window.start, Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        assert!(window.end.is_none());

        assert!(Cli::try_parse_from(["group_digest", "--since", "2024-03-01", "--last-month"]).is_err());
        assert!(Cli::try_parse_from(["group_digest", "--since", "March"]).is_err());

        let window = Cli::try_parse_from(["group_digest"]).unwrap().time_window(now);
        assert!(window.start.is_none() && window.end.is_none());
    }

    #[test]
    fn test_output_file_conflicts_with_output_dir() {
        let cli = Cli::try_parse_from(["group_digest", "--output", "digest.md"]).unwrap();
        assert_eq!(cli.output, Some(PathBuf::from("digest.md")));
        assert!(Cli::try_parse_from(["group_digest", "--output", "digest.md", "--output-dir", "out"]).is_err());
    }

    #[test]
    fn test_render_summaries_skips_groups_with_their_own_file() {
        let done = |id: &str, output_path: Option<&str>| GroupSummary {
            group_id: id.to_string(),
            group_name: format!("Group {}", id),
            executed: Vec::new(),
            summary: format!(" Summary of {}. ", id),
            output_path: output_path.map(PathBuf::from),
        };
        let report = RunReport {
            completed: vec![done("a", None), done("b", Some("out/summary_b.md")), done("c", None)],
            ..Default::default()
        };

        assert_eq!(
            render_summaries(&report),
            "# Group a\n\nSummary of a.\n\n# Group c\n\nSummary of c.\n\n"
        );
    }
}
