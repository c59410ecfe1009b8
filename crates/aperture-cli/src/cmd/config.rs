use crate::output::{print_json, print_table};
use anyhow::Context;
use aperture_core::duration;
use aperture_core::settings::{
    BackendLink, CompensationPolicy, Namespace, BACKEND_TIMEOUT, COMPENSATION_POLICY,
    DEFAULT_BACKEND_TIMEOUT, DEFAULT_DELETE_DURATION, DEFAULT_IDLE_DURATION,
    DEFAULT_IDLE_INTERVAL, DEFAULT_TICK_INTERVAL, DELETE_DURATION, IDLE_DURATION, IDLE_INTERVAL,
    TICK_INTERVAL,
};
use aperture_core::types::BackendKind;
use clap::Subcommand;
use std::collections::BTreeMap;
use std::path::Path;

use super::open_settings;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print one setting
    Get { key: String },

    /// Set a setting
    Set { key: String, value: String },

    /// Remove a setting, restoring its default
    Unset { key: String },

    /// Show every setting, with defaults for unset keys
    Show,

    /// Point a backend at its service
    Link {
        /// tracker, wiki, source-control, review or build
        backend: BackendKind,
        /// Base URL, or memory:// for an in-process backend
        url: String,
        /// Bearer token sent with every request
        #[arg(long)]
        token: Option<String>,
    },

    /// Remove a backend's link
    Unlink { backend: BackendKind },
}

const DURATION_DEFAULTS: &[(&str, &str)] = &[
    (DELETE_DURATION, DEFAULT_DELETE_DURATION),
    (IDLE_DURATION, DEFAULT_IDLE_DURATION),
    (IDLE_INTERVAL, DEFAULT_IDLE_INTERVAL),
    (BACKEND_TIMEOUT, DEFAULT_BACKEND_TIMEOUT),
    (TICK_INTERVAL, DEFAULT_TICK_INTERVAL),
];

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let settings = open_settings(root)?;
    match subcmd {
        ConfigSubcommand::Get { key } => {
            let value = settings.get(&key)?.or_else(|| default_for(&key));
            if json {
                print_json(&serde_json::json!({ "key": key, "value": value }))?;
            } else {
                match value {
                    Some(v) => println!("{v}"),
                    None => anyhow::bail!("'{key}' is not set"),
                }
            }
        }
        ConfigSubcommand::Set { key, value } => {
            check_value(&key, &value)?;
            let previous = settings
                .set(&key, &value)
                .with_context(|| format!("failed to set '{key}'"))?;
            if json {
                print_json(&serde_json::json!({ "key": key, "value": value, "previous": previous }))?;
            } else {
                println!("{key} = {value}");
            }
        }
        ConfigSubcommand::Unset { key } => {
            let previous = settings.unset(&key)?;
            if json {
                print_json(&serde_json::json!({ "key": key, "previous": previous }))?;
            } else if previous.is_some() {
                println!("unset: {key}");
            } else {
                println!("{key} was not set");
            }
        }
        ConfigSubcommand::Show => show(&settings, json)?,
        ConfigSubcommand::Link {
            backend,
            url,
            token,
        } => {
            settings.set_link(backend, Some(BackendLink { url: url.clone(), token }))?;
            println!("linked: {backend} -> {url}");
        }
        ConfigSubcommand::Unlink { backend } => {
            settings.set_link(backend, None)?;
            println!("unlinked: {backend}");
        }
    }
    Ok(())
}

fn default_for(key: &str) -> Option<String> {
    if key == COMPENSATION_POLICY {
        return Some(CompensationPolicy::default().as_str().to_string());
    }
    DURATION_DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, d)| d.to_string())
}

/// Reject values the typed accessors would silently replace with a default.
fn check_value(key: &str, value: &str) -> anyhow::Result<()> {
    if DURATION_DEFAULTS.iter().any(|(k, _)| *k == key) {
        duration::parse(value)?;
    } else if key == COMPENSATION_POLICY {
        value.parse::<CompensationPolicy>()?;
    }
    Ok(())
}

fn show(settings: &aperture_core::Settings, json: bool) -> anyhow::Result<()> {
    let mut values: BTreeMap<String, (String, &str)> = BTreeMap::new();
    for (key, default) in DURATION_DEFAULTS {
        values.insert(key.to_string(), (default.to_string(), "default"));
    }
    values.insert(
        COMPENSATION_POLICY.to_string(),
        (CompensationPolicy::default().as_str().to_string(), "default"),
    );
    for (key, value) in settings.store().entries(&Namespace::Global)? {
        let value = if key.ends_with(".token") { "********".to_string() } else { value };
        values.insert(key, (value, "set"));
    }

    if json {
        let map: BTreeMap<&String, &String> = values.iter().map(|(k, (v, _))| (k, v)).collect();
        return print_json(&map);
    }
    let rows = values
        .into_iter()
        .map(|(k, (v, source))| vec![k, v, source.to_string()])
        .collect();
    print_table(&["KEY", "VALUE", "SOURCE"], rows);
    Ok(())
}
