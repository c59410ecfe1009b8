use crate::output::{print_json, print_table};
use aperture_core::duration;
use aperture_core::scheduler::OperationKind;
use aperture_core::ApertureError;
use clap::Subcommand;
use std::path::Path;

use super::{job_row, open_scheduler, open_settings, JOB_HEADERS};

#[derive(Subcommand)]
pub enum JobsSubcommand {
    /// List queued and running jobs
    List {
        /// Include succeeded, failed and cancelled jobs
        #[arg(long)]
        all: bool,
    },

    /// List removals still inside their undo window
    Removals,

    /// Show the active job of a kind for a subject
    Show {
        /// create, remove or idle_scan
        kind: OperationKind,
        /// Issue key for create, project key for remove
        subject: String,
    },

    /// Delete finished jobs
    Prune {
        #[arg(long, default_value = "4w")]
        older_than: String,
    },
}

pub fn run(root: &Path, subcmd: JobsSubcommand, json: bool) -> anyhow::Result<()> {
    let scheduler = open_scheduler(root, open_settings(root)?)?;
    match subcmd {
        JobsSubcommand::List { all } => {
            let jobs = scheduler.list(all)?;
            if json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            print_table(JOB_HEADERS, jobs.iter().map(job_row).collect());
        }
        JobsSubcommand::Removals => {
            let jobs = scheduler.list_pending_removals()?;
            if json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("No pending removals.");
                return Ok(());
            }
            print_table(JOB_HEADERS, jobs.iter().map(job_row).collect());
        }
        JobsSubcommand::Show { kind, subject } => {
            let job = scheduler
                .find_job(kind, &subject)?
                .ok_or_else(|| ApertureError::JobNotFound(format!("{kind} {subject}")))?;
            if json {
                return print_json(&job);
            }
            println!("id:       {}", job.id);
            println!("kind:     {}", job.kind);
            println!("subject:  {}", job.subject_key);
            println!("status:   {}", job.status.label());
            println!("fire at:  {}", job.fire_at.to_rfc3339());
            if let Some(every) = job.recurrence {
                println!("every:    {}", duration::format(every));
            }
            if !job.payload.is_null() {
                println!("payload:  {}", job.payload);
            }
        }
        JobsSubcommand::Prune { older_than } => {
            let age = duration::parse(&older_than)?;
            let removed = scheduler.db().prune(age)?;
            if json {
                return print_json(&serde_json::json!({ "pruned": removed }));
            }
            println!("pruned {removed} finished job(s)");
        }
    }
    Ok(())
}
