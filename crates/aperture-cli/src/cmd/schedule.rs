use crate::output::print_json;
use anyhow::Context;
use aperture_core::collab::{RequestSource, YamlRequestSource};
use aperture_core::duration;
use clap::Subcommand;
use std::path::Path;

use super::{open_scheduler, open_settings};

#[derive(Subcommand)]
pub enum ScheduleSubcommand {
    /// Provision the project described by .aperture/requests/<ISSUE>.yaml
    Create { issue: String },

    /// Remove a project once the undo window (delete-duration) has passed
    Remove {
        project: String,
        /// Who asked for the removal
        #[arg(long = "by", env = "USER", default_value = "operator")]
        requested_by: String,
    },

    /// Cancel a pending removal
    Cancel { project: String },
}

pub fn run(root: &Path, subcmd: ScheduleSubcommand, json: bool) -> anyhow::Result<()> {
    let settings = open_settings(root)?;
    match subcmd {
        ScheduleSubcommand::Create { issue } => {
            let request = YamlRequestSource::new(root)
                .load(&issue)
                .with_context(|| format!("cannot schedule creation for {issue}"))?;
            let scheduler = open_scheduler(root, settings)?;
            let job = scheduler.schedule_create(&issue)?;
            if json {
                print_json(&job)?;
            } else {
                println!(
                    "create of {} for {issue} queued (job {})",
                    request.project_key, job.id
                );
            }
        }
        ScheduleSubcommand::Remove {
            project,
            requested_by,
        } => {
            let window = duration::format(settings.delete_duration());
            let scheduler = open_scheduler(root, settings)?;
            let job = scheduler.schedule_removal(&project, &requested_by)?;
            if json {
                print_json(&job)?;
            } else {
                println!(
                    "removal of {project} scheduled for {} (in {window}); cancel with `aperture schedule cancel {project}`",
                    job.fire_at.to_rfc3339()
                );
            }
        }
        ScheduleSubcommand::Cancel { project } => {
            let scheduler = open_scheduler(root, settings)?;
            let cancelled = scheduler.cancel_removal(&project)?;
            if json {
                print_json(&serde_json::json!({ "project": project, "cancelled": cancelled }))?;
            } else if cancelled.is_some() {
                println!("removal of {project} cancelled");
            } else {
                println!("no pending removal for {project}");
            }
        }
    }
    Ok(())
}
