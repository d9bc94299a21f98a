// stages.rs - Pipeline stages and their dependency graph
//
// A stage runs when its output is missing from the checkpoint, when a redo
// flag forces it, or when any stage it depends on runs. The last rule is a
// traversal over `Stage::dependents`, not a set of flag special cases.

use crate::checkpoint::GroupProgress;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    AttachmentDescription,
    LinkSummary,
    Merge,
    ThemeClustering,
    FinalSummary,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 5] = [
        Stage::AttachmentDescription,
        Stage::LinkSummary,
        Stage::Merge,
        Stage::ThemeClustering,
        Stage::FinalSummary,
    ];

    /// Key under which the stage output is stored in the resume file.
    pub fn key(self) -> &'static str {
        match self {
            Stage::AttachmentDescription => "attachment_descriptions",
            Stage::LinkSummary => "link_summaries",
            Stage::Merge => "merged_messages",
            Stage::ThemeClustering => "theme_clusters",
            Stage::FinalSummary => "final_summary",
        }
    }

    /// Stages whose output this stage consumes.
    pub fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::AttachmentDescription | Stage::LinkSummary => &[],
            Stage::Merge => &[Stage::AttachmentDescription, Stage::LinkSummary],
            Stage::ThemeClustering => &[Stage::Merge],
            Stage::FinalSummary => &[Stage::Merge, Stage::ThemeClustering],
        }
    }

    /// Stages that directly consume this stage's output.
    pub fn dependents(self) -> impl Iterator<Item = Stage> {
        Stage::ALL
            .into_iter()
            .filter(move |candidate| candidate.dependencies().contains(&self))
    }

    /// Every stage reachable downstream of this one.
    pub fn downstream(self) -> BTreeSet<Stage> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<Stage> = self.dependents().collect();
        while let Some(stage) = pending.pop() {
            if seen.insert(stage) {
                pending.extend(stage.dependents());
            }
        }
        seen
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::AttachmentDescription => "AttachmentDescription",
            Stage::LinkSummary => "LinkSummary",
            Stage::Merge => "Merge",
            Stage::ThemeClustering => "ThemeClustering",
            Stage::FinalSummary => "FinalSummary",
        };
        f.write_str(name)
    }
}

/// Force-redo switches from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoFlags {
    pub attachment_descriptions: bool,
    pub link_summaries: bool,
    pub merging: bool,
    pub themes: bool,
}

impl RedoFlags {
    /// Themes are extracted while merging, so redoing themes forces Merge too.
    pub fn forced_stages(&self) -> BTreeSet<Stage> {
        let mut forced = BTreeSet::new();
        if self.attachment_descriptions {
            forced.insert(Stage::AttachmentDescription);
        }
        if self.link_summaries {
            forced.insert(Stage::LinkSummary);
        }
        if self.merging {
            forced.insert(Stage::Merge);
        }
        if self.themes {
            forced.insert(Stage::Merge);
            forced.insert(Stage::ThemeClustering);
        }
        forced
    }
}

/// Stages that must run for one group in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    dirty: BTreeSet<Stage>,
}

impl StagePlan {
    pub fn new(progress: Option<&GroupProgress>, forced: &BTreeSet<Stage>) -> Self {
        let mut dirty: BTreeSet<Stage> = Stage::ALL
            .into_iter()
            .filter(|stage| forced.contains(stage) || !progress.map_or(false, |p| p.contains(stage.key())))
            .collect();

        let roots: Vec<Stage> = dirty.iter().copied().collect();
        for stage in roots {
            dirty.extend(stage.downstream());
        }
        Self { dirty }
    }

    pub fn should_run(&self, stage: Stage) -> bool {
        self.dirty.contains(&stage)
    }

    /// Dirty stages in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        self.dirty.iter().copied().collect()
    }
}
