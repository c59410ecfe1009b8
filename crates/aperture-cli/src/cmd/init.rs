use anyhow::Context;
use aperture_core::{io, paths};
use std::path::Path;

const DEFAULT_SETTINGS: &str = "\
global:
  delete-duration: 2w
  idle-duration: 90d
  idle-interval: 1w
  compensation-policy: teardown
";

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing aperture in: {}", root.display());

    for dir in [paths::APERTURE_DIR, paths::REQUESTS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let settings = paths::settings_path(root);
    if io::write_if_missing(&settings, DEFAULT_SETTINGS.as_bytes())
        .context("failed to write settings.yaml")?
    {
        println!("  created: {}", paths::SETTINGS_FILE);
    } else {
        println!("  exists:  {}", paths::SETTINGS_FILE);
    }

    println!("\nNext: aperture config set automation-user <USER>");
    Ok(())
}
