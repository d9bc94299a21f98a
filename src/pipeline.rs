// pipeline.rs - Per-group summarization state machine
//
// Stages run in order for each group:
//   AttachmentDescription -> LinkSummary -> Merge -> ThemeClustering -> FinalSummary
//
// Each stage output is written into the checkpoint and the resume file is
// saved before the next stage starts, so an interrupted run picks up at the
// first missing stage. Which stages run is decided once per group by
// StagePlan (missing output, redo flags, and everything downstream of those).
//
// Failure policy for model calls that exhaust their retries:
// - image description / voice note transcription: fixed fallback text, the
//   group continues
// - link fetch / link summary: the link is skipped, the group continues
// - theme extraction, embeddings, final summary: the group fails; its finished
//   stages stay in the checkpoint and the next group is attempted

use crate::checkpoint::CheckpointStore;
use crate::cluster::{Cluster, ThemeClusterer};
use crate::error::{DigestError, DigestResult};
use crate::lm::{ImageDescriber, TextGenerator, Transcriber};
use crate::messages::{GroupBatch, GroupMessage, MessageSource, TimeWindow};
use crate::observe::Observer;
use crate::prompts::{self, PromptSet};
use crate::retry::Executor;
use crate::stages::{RedoFlags, Stage, StagePlan};
use crate::sum::{extract_links, LinkFetcher};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ATTACHMENT_FALLBACK: &str = "Description unavailable due to an error.";
pub const TRANSCRIPTION_FALLBACK: &str = "Transcription unavailable due to an error.";

// Stage payloads as stored in the resume file

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    #[default]
    Image,
    VoiceNote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescription {
    pub path: PathBuf,
    /// Missing in resume files written before voice notes were transcribed.
    #[serde(default)]
    pub kind: AttachmentKind,
    /// Image description or voice note transcript.
    pub description: String,
}

/// Message id -> descriptions of its image and audio attachments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentDescriptions(pub BTreeMap<i64, Vec<AttachmentDescription>>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub url: String,
    pub summary: String,
}

/// Message id -> summaries of the links it contains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkSummaries(pub BTreeMap<i64, Vec<LinkSummary>>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedMessage {
    pub id: i64,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedGroup {
    pub messages: Vec<EnrichedMessage>,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThemeClusters {
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub text: String,
}

pub struct Services {
    pub summarizer: Arc<dyn TextGenerator>,
    /// `None` when vision is disabled; attachments are then only named.
    pub vision: Option<Arc<dyn ImageDescriber>>,
    /// `None` when transcription is disabled; voice notes are then only named.
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub fetcher: Arc<dyn LinkFetcher>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub redo: RedoFlags,
    pub prompts: PromptSet,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary {
    pub group_id: String,
    pub group_name: String,
    pub executed: Vec<Stage>,
    pub summary: String,
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<GroupSummary>,
    /// Groups with no messages in the requested window.
    pub skipped: Vec<String>,
    /// (group id, error message)
    pub failed: Vec<(String, String)>,
}

pub struct Orchestrator {
    services: Services,
    executor: Executor,
    clusterer: ThemeClusterer,
    checkpoint: CheckpointStore,
    resume_file: Option<PathBuf>,
    options: PipelineOptions,
    /// Output files written during this run -> owning group id.
    written: HashMap<PathBuf, String>,
    observer: Observer,
}

impl Orchestrator {
    pub fn new(
        services: Services,
        executor: Executor,
        clusterer: ThemeClusterer,
        checkpoint: CheckpointStore,
        resume_file: Option<PathBuf>,
        options: PipelineOptions,
        observer: &Observer,
    ) -> Self {
        Self {
            services,
            executor,
            clusterer,
            checkpoint,
            resume_file,
            options,
            written: HashMap::new(),
            observer: observer.scoped("pipeline"),
        }
    }

    #[cfg(test)]
    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Processes groups one after another. A failing group is reported and
    /// the next one is attempted; only checkpoint persistence errors abort.
    pub async fn run(
        &mut self,
        source: &dyn MessageSource,
        group_ids: &[String],
        window: &TimeWindow,
    ) -> DigestResult<RunReport> {
        let mut report = RunReport::default();

        for group_id in group_ids {
            let result = match source.group_messages(group_id, window) {
                Ok(batch) => self.summarize_group(&batch).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(summary)) => report.completed.push(summary),
                Ok(None) => report.skipped.push(group_id.clone()),
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(e) => {
                    error!(target: self.observer.target(), "❌ Group {} failed: {}", group_id, e);
                    report.failed.push((group_id.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Runs the stages a group still needs. Returns `None` when the group has
    /// no messages in the window.
    pub async fn summarize_group(&mut self, batch: &GroupBatch) -> DigestResult<Option<GroupSummary>> {
        let target = self.observer.target().to_string();
        if batch.messages.is_empty() {
            info!(target: target.as_str(), "📭 No messages for group {} ({}) in the requested window, skipping", batch.name, batch.id);
            return Ok(None);
        }

        let forced = self.options.redo.forced_stages();
        if let Some(progress) = self.checkpoint.group(&batch.id) {
            let stored: Vec<&str> = progress.stage_keys().collect();
            info!(target: target.as_str(), "📂 Resuming group {} with stored stages: {}", batch.id, stored.join(", "));
        }
        let plan = StagePlan::new(self.checkpoint.group(&batch.id), &forced);
        info!(
            target: target.as_str(),
            "🚀 Group {} ({}): {} messages, stages to run: {:?}",
            batch.name,
            batch.id,
            batch.messages.len(),
            plan.stages()
        );
        let mut executed = Vec::new();

        let attachments: AttachmentDescriptions = if plan.should_run(Stage::AttachmentDescription) {
            let result = self.describe_attachments(batch).await;
            self.record(&batch.id, Stage::AttachmentDescription, &result)?;
            executed.push(Stage::AttachmentDescription);
            result
        } else {
            self.restore(&batch.id, Stage::AttachmentDescription)?
        };

        let links: LinkSummaries = if plan.should_run(Stage::LinkSummary) {
            let result = self.summarize_links(batch).await;
            self.record(&batch.id, Stage::LinkSummary, &result)?;
            executed.push(Stage::LinkSummary);
            result
        } else {
            self.restore(&batch.id, Stage::LinkSummary)?
        };

        let merged: MergedGroup = if plan.should_run(Stage::Merge) {
            let result = self.merge(batch, &attachments, &links).await?;
            self.record(&batch.id, Stage::Merge, &result)?;
            executed.push(Stage::Merge);
            result
        } else {
            self.restore(&batch.id, Stage::Merge)?
        };

        let clusters: ThemeClusters = if plan.should_run(Stage::ThemeClustering) {
            let result = ThemeClusters {
                clusters: self.clusterer.cluster(&merged.themes).await?,
            };
            self.record(&batch.id, Stage::ThemeClustering, &result)?;
            executed.push(Stage::ThemeClustering);
            result
        } else {
            self.restore(&batch.id, Stage::ThemeClustering)?
        };

        let summary: FinalSummary = if plan.should_run(Stage::FinalSummary) {
            let result = self.final_summary(batch, &merged, &clusters).await?;
            self.record(&batch.id, Stage::FinalSummary, &result)?;
            executed.push(Stage::FinalSummary);
            result
        } else {
            self.restore(&batch.id, Stage::FinalSummary)?
        };

        let output_path = self.write_output(batch, &summary.text)?;

        self.checkpoint.clear_group(&batch.id);
        self.checkpoint.save(self.resume_file.as_deref())?;
        info!(target: target.as_str(), "✅ Group {} ({}) summarized", batch.name, batch.id);

        Ok(Some(GroupSummary {
            group_id: batch.id.clone(),
            group_name: batch.name.clone(),
            executed,
            summary: summary.text,
            output_path,
        }))
    }

    /// Deletes the resume file once no group has pending progress, unless
    /// the caller asked to keep it.
    pub fn finish(&self, keep_resume_file: bool) -> DigestResult<()> {
        let target = self.observer.target();
        let Some(path) = self.resume_file.as_deref() else {
            return Ok(());
        };

        if !self.checkpoint.is_empty() {
            let pending: Vec<&str> = self.checkpoint.pending_groups().collect();
            info!(target: target, "📌 Keeping resume file {}; pending groups: {}", path.display(), pending.join(", "));
            return Ok(());
        }

        if keep_resume_file {
            info!(target: target, "📌 All groups processed. Keeping resume file {} as requested", path.display());
        } else {
            CheckpointStore::delete(Some(path))?;
            info!(target: target, "🗑️ All groups processed. Deleted resume file {}", path.display());
        }
        Ok(())
    }

    fn record<T: Serialize>(&mut self, group_id: &str, stage: Stage, payload: &T) -> DigestResult<()> {
        let value = serde_json::to_value(payload)?;
        let progress = self.checkpoint.group_mut(group_id);
        progress.insert(stage.key(), value);
        // Outputs computed from the previous version of this stage are stale now.
        for stale in stage.downstream() {
            progress.remove(stale.key());
        }
        self.checkpoint.save(self.resume_file.as_deref())?;
        debug!(target: self.observer.target(), "💾 {} stored for group {}", stage, group_id);
        Ok(())
    }

    fn restore<T: DeserializeOwned>(&self, group_id: &str, stage: Stage) -> DigestResult<T> {
        let value = self
            .checkpoint
            .group(group_id)
            .and_then(|progress| progress.get(stage.key()))
            .cloned()
            .ok_or_else(|| DigestError::Payload {
                stage: stage.key(),
                source: <serde_json::Error as serde::de::Error>::custom("stage output missing from checkpoint"),
            })?;
        debug!(target: self.observer.target(), "♻️ Reusing {} for group {}", stage, group_id);
        serde_json::from_value(value).map_err(|source| DigestError::Payload {
            stage: stage.key(),
            source,
        })
    }

    async fn describe_attachments(&self, batch: &GroupBatch) -> AttachmentDescriptions {
        let target = self.observer.target();
        let mut described = BTreeMap::new();

        if self.services.vision.is_none() {
            info!(target: target, "🖼️ Vision disabled, images will only be named");
        }
        if self.services.transcriber.is_none() {
            info!(target: target, "🎙️ Transcription disabled, voice notes will only be named");
        }

        for message in batch.messages.iter().filter(|m| !m.attachments.is_empty()) {
            let mut descriptions = Vec::new();
            for path in &message.attachments {
                let (kind, description) = match attachment_kind(path) {
                    Some(AttachmentKind::Image) => {
                        let Some(vision) = &self.services.vision else { continue };
                        let label = format!("image '{}'", path.display());
                        let description = self
                            .executor
                            .invoke_or(&label, ATTACHMENT_FALLBACK.to_string(), || {
                                vision.describe_image(&self.options.prompts.attachment, path)
                            })
                            .await;
                        (AttachmentKind::Image, description)
                    }
                    Some(AttachmentKind::VoiceNote) => {
                        let Some(transcriber) = &self.services.transcriber else { continue };
                        let label = format!("transcription of '{}'", path.display());
                        let transcript = self
                            .executor
                            .invoke_or(&label, TRANSCRIPTION_FALLBACK.to_string(), || transcriber.transcribe(path))
                            .await;
                        (AttachmentKind::VoiceNote, transcript)
                    }
                    None => continue,
                };
                descriptions.push(AttachmentDescription {
                    path: path.clone(),
                    kind,
                    description: description.trim().to_string(),
                });
            }
            if !descriptions.is_empty() {
                described.insert(message.id, descriptions);
            }
        }

        info!(target: target, "🖼️ Described attachments of {} message(s)", described.len());
        AttachmentDescriptions(described)
    }

    async fn summarize_links(&self, batch: &GroupBatch) -> LinkSummaries {
        let target = self.observer.target();
        let mut summaries = BTreeMap::new();

        for message in &batch.messages {
            let mut found = Vec::new();
            for url in extract_links(&message.text) {
                let page = match self
                    .executor
                    .invoke(&format!("fetch of {}", url), || self.services.fetcher.fetch(&url))
                    .await
                {
                    Ok(page) if !page.trim().is_empty() => page,
                    Ok(_) => {
                        warn!(target: target, "⚠️ {} has no readable text, skipping", url);
                        continue;
                    }
                    Err(e) => {
                        warn!(target: target, "⚠️ Skipping link {}: {}", url, e);
                        continue;
                    }
                };

                let prompt = prompts::link_summary_prompt(&self.options.prompts, &url, &page);
                match self
                    .executor
                    .invoke(&format!("link summary for {}", url), || self.services.summarizer.generate(&prompt))
                    .await
                {
                    Ok(summary) => found.push(LinkSummary { url, summary }),
                    Err(e) => warn!(target: target, "⚠️ Skipping link {}: {}", url, e),
                }
            }
            if !found.is_empty() {
                summaries.insert(message.id, found);
            }
        }

        info!(target: target, "🔗 Summarized links in {} message(s)", summaries.len());
        LinkSummaries(summaries)
    }

    async fn merge(
        &self,
        batch: &GroupBatch,
        attachments: &AttachmentDescriptions,
        links: &LinkSummaries,
    ) -> DigestResult<MergedGroup> {
        let messages: Vec<EnrichedMessage> = batch
            .messages
            .iter()
            .map(|message| {
                enrich_message(
                    message,
                    attachments.0.get(&message.id).map(Vec::as_slice).unwrap_or(&[]),
                    links.0.get(&message.id).map(Vec::as_slice).unwrap_or(&[]),
                )
            })
            .collect();

        let transcript = render_transcript(&messages);
        let themes = if transcript.trim().is_empty() {
            Vec::new()
        } else {
            let prompt = prompts::theme_prompt(&self.options.prompts, &transcript);
            let response = self
                .executor
                .invoke("theme extraction", || self.services.summarizer.generate(&prompt))
                .await?;
            prompts::parse_themes(&response)
        };

        info!(
            target: self.observer.target(),
            "🧵 Merged {} messages, extracted {} theme(s)",
            messages.len(),
            themes.len()
        );
        Ok(MergedGroup { messages, themes })
    }

    async fn final_summary(
        &self,
        batch: &GroupBatch,
        merged: &MergedGroup,
        clusters: &ThemeClusters,
    ) -> DigestResult<FinalSummary> {
        let outline = theme_outline(&merged.themes, &clusters.clusters);
        let transcript = render_transcript(&merged.messages);
        let prompt = prompts::summary_prompt(&self.options.prompts, &batch.name, &outline, &transcript);
        let text = self
            .executor
            .invoke("final summary", || self.services.summarizer.generate(&prompt))
            .await?;
        Ok(FinalSummary { text })
    }

    fn write_output(&mut self, batch: &GroupBatch, text: &str) -> DigestResult<Option<PathBuf>> {
        let Some(dir) = self.options.output_dir.clone() else {
            return Ok(None);
        };
        fs::create_dir_all(&dir)?;
        let path = self.claim_output_path(&dir, batch);
        fs::write(&path, format!("# {}\n\n{}\n", batch.name, text.trim()))?;
        info!(target: self.observer.target(), "📝 Summary written to {}", path.display());
        Ok(Some(path))
    }

    /// `summary_<name>_<id>.md`. Slugs are lossy, so a path already written
    /// for another group this run gets a numeric suffix instead.
    fn claim_output_path(&mut self, dir: &Path, batch: &GroupBatch) -> PathBuf {
        let stem = format!("summary_{}_{}", slug(&batch.name), slug(&batch.id));
        let mut path = dir.join(format!("{}.md", stem));
        let mut suffix = 2;
        while self.written.get(&path).is_some_and(|owner| owner != &batch.id) {
            path = dir.join(format!("{}_{}.md", stem, suffix));
            suffix += 1;
        }
        self.written.insert(path.clone(), batch.id.clone());
        path
    }
}

fn attachment_kind(path: &Path) -> Option<AttachmentKind> {
    let mime = mime_guess::from_path(path).first()?;
    if mime.type_() == mime_guess::mime::IMAGE {
        Some(AttachmentKind::Image)
    } else if mime.type_() == mime_guess::mime::AUDIO {
        Some(AttachmentKind::VoiceNote)
    } else {
        None
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Folds quotes, attachment descriptions, voice note transcripts and link
/// summaries into the message text.
fn enrich_message(message: &GroupMessage, attachments: &[AttachmentDescription], links: &[LinkSummary]) -> EnrichedMessage {
    let mut text = message.text.trim().to_string();

    if let Some(quote) = &message.quote {
        text = format!("(replying to {}: \"{}\") {}", quote.author, quote.text.trim(), text);
    }

    for path in &message.attachments {
        match attachments.iter().find(|a| &a.path == path) {
            Some(described) if described.kind == AttachmentKind::VoiceNote => {
                text.push_str(&format!("\n[Voice note {}: {}]", file_name(path), described.description))
            }
            Some(described) => text.push_str(&format!("\n[Attachment {}: {}]", file_name(path), described.description)),
            None => text.push_str(&format!("\n[Attachment: {}]", file_name(path))),
        }
    }

    for link in links {
        text.push_str(&format!("\n[Link {}: {}]", link.url, link.summary.trim()));
    }

    EnrichedMessage {
        id: message.id,
        sender: message.sender.clone(),
        timestamp: message.timestamp,
        text: text.trim().to_string(),
    }
}

fn render_transcript(messages: &[EnrichedMessage]) -> String {
    messages
        .iter()
        .filter(|m| !m.text.is_empty())
        .map(|m| format!("[{}] {}: {}", m.timestamp.format("%Y-%m-%d %H:%M"), m.sender, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per cluster ("a / b / c"), then every unclustered theme on its own.
fn theme_outline(themes: &[String], clusters: &[Cluster]) -> String {
    let mut covered = HashSet::new();
    let mut lines = Vec::new();

    for cluster in clusters {
        let names: Vec<&str> = cluster
            .members()
            .iter()
            .filter_map(|&index| themes.get(index).map(String::as_str))
            .collect();
        if names.is_empty() {
            continue;
        }
        covered.extend(cluster.members().iter().copied());
        lines.push(format!("- {}", names.join(" / ")));
    }

    for (index, theme) in themes.iter().enumerate() {
        if !covered.contains(&index) {
            lines.push(format!("- {}", theme));
        }
    }

    if lines.is_empty() {
        "- (no themes identified)".to_string()
    } else {
        lines.join("\n")
    }
}

fn slug(name: &str) -> String {
    let mut slug = String::new();
    for c in name.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "group".to_string()
    } else {
        slug
    }
}
